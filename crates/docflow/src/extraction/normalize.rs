//! Cleanup applied to every extracted text

use regex::Regex;
use std::sync::OnceLock;

/// Typographic characters folded to plain ASCII
const FOLDS: &[(char, &str)] = &[
    ('\u{FB00}', "ff"),
    ('\u{FB01}', "fi"),
    ('\u{FB02}', "fl"),
    ('\u{FB03}', "ffi"),
    ('\u{FB04}', "ffl"),
    ('\u{2010}', "-"),
    ('\u{2011}', "-"),
    ('\u{2013}', "-"),
    ('\u{2014}', "--"),
    ('\u{2018}', "'"),
    ('\u{2019}', "'"),
    ('\u{201C}', "\""),
    ('\u{201D}', "\""),
    ('\u{2022}', "* "),
    ('\u{2026}', "..."),
    ('\u{00A0}', " "),
    ('\u{FEFF}', ""),
];

fn blank_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n{3,}").expect("static regex"))
}

fn space_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[ \t]{2,}").expect("static regex"))
}

/// Remove NULs, fold ligatures and smart punctuation, trim lines and collapse blank runs
pub fn normalize_text(text: &str) -> String {
    let mut folded = String::with_capacity(text.len());
    for c in text.chars() {
        match FOLDS.iter().find(|(from, _)| *from == c) {
            Some((_, to)) => folded.push_str(to),
            None if c == '\0' => {}
            None if c == '\r' => {}
            None => folded.push(c),
        }
    }

    let trimmed = folded
        .lines()
        .map(|line| space_runs().replace_all(line.trim(), " ").into_owned())
        .collect::<Vec<_>>()
        .join("\n");

    blank_runs()
        .replace_all(trimmed.trim(), "\n\n")
        .into_owned()
}
