//! Best-effort undo script derivation
//!
//! Only service state changes are reversed. Anything else that mutates the
//! host is emitted as a commented `UNREVERSIBLE` line and reported in
//! `flagged`; it is never executed.

const HEADER: &str = "#!/bin/sh\n# derived undo script\n";

/// A derived undo script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoScript {
    pub script: String,
    /// Nothing had to be flagged
    pub reversible: bool,
    /// Original lines that could not be reversed
    pub flagged: Vec<String>,
    /// Number of commands that will actually run
    pub commands: usize,
}

fn invert_verb(verb: &str) -> Option<&'static str> {
    match verb {
        "start" => Some("stop"),
        "stop" => Some("start"),
        "enable" => Some("disable"),
        "disable" => Some("enable"),
        "mask" => Some("unmask"),
        "unmask" => Some("mask"),
        _ => None,
    }
}

/// Verbs that leave nothing to reverse
fn is_neutral_verb(verb: &str) -> bool {
    matches!(verb, "restart" | "reload" | "try-restart" | "status" | "daemon-reload" | "is-active")
}

enum LineUndo {
    Skip,
    Reverse(String),
    Neutral,
    Flag,
}

fn undo_line(line: &str) -> LineUndo {
    let words: Vec<&str> = line.split_whitespace().collect();
    let words = match words.first() {
        Some(&"sudo") => &words[1..],
        _ => &words[..],
    };
    match words {
        [] => LineUndo::Skip,
        ["set", ..] => LineUndo::Skip,
        ["systemctl", rest @ ..] => {
            let args: Vec<&str> = rest.iter().copied().filter(|w| !w.starts_with('-')).collect();
            match args.as_slice() {
                [verb, ..] if is_neutral_verb(verb) => LineUndo::Neutral,
                [verb, units @ ..] if !units.is_empty() => match invert_verb(verb) {
                    Some(inverse) => {
                        LineUndo::Reverse(format!("systemctl {} {}", inverse, units.join(" ")))
                    }
                    None => LineUndo::Flag,
                },
                _ => LineUndo::Flag,
            }
        }
        ["service", unit, verb, ..] => {
            if is_neutral_verb(verb) {
                LineUndo::Neutral
            } else {
                match invert_verb(verb) {
                    Some(inverse) => LineUndo::Reverse(format!("service {} {}", unit, inverse)),
                    None => LineUndo::Flag,
                }
            }
        }
        ["echo", ..] | ["true"] | [":"] => LineUndo::Neutral,
        _ => LineUndo::Flag,
    }
}

/// Derive an undo script from patch content.
///
/// Reversed commands run in reverse order of the original.
pub fn synthesize_undo(content: &str) -> UndoScript {
    let mut reversed = Vec::new();
    let mut flagged = Vec::new();

    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match undo_line(line) {
            LineUndo::Reverse(cmd) => reversed.push(cmd),
            LineUndo::Flag => flagged.push(line.to_string()),
            LineUndo::Skip | LineUndo::Neutral => {}
        }
    }

    let mut script = String::from(HEADER);
    for line in &flagged {
        script.push_str("# UNREVERSIBLE: ");
        script.push_str(line);
        script.push('\n');
    }
    for cmd in reversed.iter().rev() {
        script.push_str(cmd);
        script.push('\n');
    }

    UndoScript {
        script,
        reversible: flagged.is_empty(),
        flagged,
        commands: reversed.len(),
    }
}
