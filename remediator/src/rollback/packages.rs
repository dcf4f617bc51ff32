//! Package manager helpers shared by backup and rollback

use std::collections::HashMap;

use crate::models::asset::PackageManager;
use crate::utils::shell_quote;

/// Prints the first package manager found on the target
pub const PROBE_SCRIPT: &str = "for pm in apt-get dnf yum zypper apk; do \
command -v $pm >/dev/null 2>&1 && { echo $pm; exit 0; }; done; exit 1";

/// Verbs that change installed packages
const CHANGE_VERBS: &[&str] = &[
    "install", "reinstall", "upgrade", "update", "dist-upgrade", "downgrade", "remove",
    "purge", "erase", "add", "del", "in", "up",
];

/// Verbs that bring packages in, whose arguments name the packages
const INSTALL_VERBS: &[&str] = &[
    "install", "reinstall", "upgrade", "update", "downgrade", "add", "in", "up",
];

impl PackageManager {
    /// Map a command name (or path) to its package manager
    pub fn from_binary(word: &str) -> Option<Self> {
        let name = word.rsplit('/').next().unwrap_or(word);
        match name {
            "apt-get" | "apt" => Some(PackageManager::Apt),
            "yum" => Some(PackageManager::Yum),
            "dnf" => Some(PackageManager::Dnf),
            "zypper" => Some(PackageManager::Zypper),
            "apk" => Some(PackageManager::Apk),
            _ => None,
        }
    }

    /// Parse the output of [`PROBE_SCRIPT`]
    pub fn parse_probe(stdout: &str) -> Option<Self> {
        stdout.lines().find_map(|line| Self::from_binary(line.trim()))
    }

    /// Dump installed packages as `name<TAB>version` lines
    pub fn list_installed_command(&self) -> &'static str {
        match self {
            PackageManager::Apt => "dpkg-query -W -f='${Package}\\t${Version}\\n'",
            PackageManager::Yum | PackageManager::Dnf | PackageManager::Zypper => {
                "rpm -qa --qf '%{NAME}\\t%{VERSION}-%{RELEASE}\\n'"
            }
            PackageManager::Apk => {
                "apk info -v 2>/dev/null | sed -E 's/^(.+)-([^-]+-r[0-9]+)$/\\1\\t\\2/'"
            }
        }
    }

    /// Install exactly `version` of `package`, downgrading if needed
    pub fn pin_command(&self, package: &str, version: &str) -> String {
        match self {
            PackageManager::Apt => format!(
                "DEBIAN_FRONTEND=noninteractive apt-get install -y --allow-downgrades {}",
                shell_quote(&format!("{}={}", package, version))
            ),
            PackageManager::Yum | PackageManager::Dnf => {
                let bin = if *self == PackageManager::Yum { "yum" } else { "dnf" };
                let spec = shell_quote(&format!("{}-{}", package, version));
                format!(
                    "{bin} downgrade -y {spec} || {bin} install -y {spec}",
                    bin = bin,
                    spec = spec
                )
            }
            PackageManager::Zypper => format!(
                "zypper --non-interactive install --oldpackage {}",
                shell_quote(&format!("{}={}", package, version))
            ),
            PackageManager::Apk => format!(
                "apk add {}",
                shell_quote(&format!("{}={}", package, version))
            ),
        }
    }

    pub fn remove_command(&self, package: &str) -> String {
        let package = shell_quote(package);
        match self {
            PackageManager::Apt => {
                format!("DEBIAN_FRONTEND=noninteractive apt-get remove -y {}", package)
            }
            PackageManager::Yum => format!("yum remove -y {}", package),
            PackageManager::Dnf => format!("dnf remove -y {}", package),
            PackageManager::Zypper => format!("zypper --non-interactive remove {}", package),
            PackageManager::Apk => format!("apk del {}", package),
        }
    }

    pub fn reinstall_command(&self, package: &str) -> String {
        let package = shell_quote(package);
        match self {
            PackageManager::Apt => format!(
                "DEBIAN_FRONTEND=noninteractive apt-get install -y --reinstall {}",
                package
            ),
            PackageManager::Yum => format!("yum reinstall -y {}", package),
            PackageManager::Dnf => format!("dnf reinstall -y {}", package),
            PackageManager::Zypper => format!("zypper --non-interactive install -f {}", package),
            PackageManager::Apk => format!("apk fix {}", package),
        }
    }
}

/// Split content into simple commands on newlines and shell separators
fn commands(content: &str) -> impl Iterator<Item = Vec<&str>> {
    content
        .split(['\n', ';', '|', '&'])
        .map(|cmd| cmd.split_whitespace().collect::<Vec<_>>())
        .filter(|words| !words.is_empty())
}

/// Skip `sudo`, `env` and `VAR=value` prefixes
fn strip_prefixes<'a>(words: &'a [&'a str]) -> &'a [&'a str] {
    let mut rest = words;
    while let Some((first, tail)) = rest.split_first() {
        let is_prefix = *first == "sudo"
            || *first == "env"
            || (first.contains('=') && !first.starts_with('-') && !first.starts_with('='));
        if !is_prefix {
            break;
        }
        rest = tail;
    }
    rest
}

/// Manager and verb of a package command, if `words` is one
fn package_command<'a>(words: &'a [&'a str]) -> Option<(PackageManager, &'a str, &'a [&'a str])> {
    let words = strip_prefixes(words);
    let (first, rest) = words.split_first()?;
    let manager = PackageManager::from_binary(first)?;
    let verb_pos = rest.iter().position(|w| !w.starts_with('-'))?;
    Some((manager, rest[verb_pos], &rest[verb_pos + 1..]))
}

/// Whether `content` changes installed packages
pub fn has_package_verb(content: &str) -> bool {
    commands(content).any(|words| {
        package_command(&words).is_some_and(|(_, verb, _)| CHANGE_VERBS.contains(&verb))
    })
}

/// First package manager invoked by `content`
pub fn manager_in_content(content: &str) -> Option<PackageManager> {
    commands(content).find_map(|words| package_command(&words).map(|(pm, _, _)| pm))
}

/// Package names brought in by install-type verbs, in order, without versions
pub fn extract_install_packages(content: &str) -> Vec<String> {
    let mut packages: Vec<String> = Vec::new();
    for words in commands(content) {
        let Some((_, verb, args)) = package_command(&words) else {
            continue;
        };
        if !INSTALL_VERBS.contains(&verb) {
            continue;
        }
        for arg in args {
            if arg.starts_with('-') || arg.contains(['$', '>', '<', '`', '(']) {
                continue;
            }
            let name = arg.split('=').next().unwrap_or(arg);
            if !name.is_empty() && !packages.iter().any(|p| p == name) {
                packages.push(name.to_string());
            }
        }
    }
    packages
}

/// Parse `name<TAB>version` lines from [`PackageManager::list_installed_command`]
pub fn parse_package_list(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let (name, version) = line.trim().split_once('\t')?;
            let (name, version) = (name.trim(), version.trim());
            if name.is_empty() || version.is_empty() {
                return None;
            }
            Some((name.to_string(), version.to_string()))
        })
        .collect()
}
