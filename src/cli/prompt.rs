//! Terminal prompts
//!
//! [`TerminalPrompter`] answers the login flow's CAPTCHA, device choice and
//! one-time code questions on stdin/stderr.

use std::io::{self, BufRead, Write};

use crate::app::auth::Prompter;

/// Reads one trimmed line after printing `message`; `None` at end of input
pub fn read_line(message: &str) -> io::Result<Option<String>> {
    let mut stderr = io::stderr();
    write!(stderr, "{}: ", message)?;
    stderr.flush()?;

    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

/// Asks until a non-empty answer is given; `None` on end of input
pub fn read_required(message: &str) -> Option<String> {
    loop {
        match read_line(message) {
            Ok(Some(answer)) if !answer.is_empty() => return Some(answer),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

/// Parses a 1-based menu answer into an index
pub fn parse_choice(answer: &str, count: usize) -> Option<usize> {
    let n: usize = answer.trim().parse().ok()?;
    (1..=count).contains(&n).then(|| n - 1)
}

/// Numbered menu; returns the chosen index
pub fn choose(message: &str, options: &[String]) -> Option<usize> {
    if options.is_empty() {
        return None;
    }
    eprintln!("{}", message);
    for (i, option) in options.iter().enumerate() {
        eprintln!("  {}) {}", i + 1, option);
    }
    loop {
        let answer = read_required(&format!("Choice [1-{}]", options.len()))?;
        match parse_choice(&answer, options.len()) {
            Some(index) => return Some(index),
            None => eprintln!("Please enter a number between 1 and {}", options.len()),
        }
    }
}

/// Yes/no question, defaulting to `default` on an empty answer
pub fn confirm(message: &str, default: bool) -> bool {
    let hint = if default { "[Y/n]" } else { "[y/N]" };
    match read_line(&format!("{} {}", message, hint)) {
        Ok(Some(answer)) if answer.is_empty() => default,
        Ok(Some(answer)) => answer.to_lowercase().starts_with('y'),
        Ok(None) | Err(_) => false,
    }
}

/// Interactive prompter for terminal sessions
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn captcha(&self, image_url: &str) -> Option<String> {
        eprintln!("{}", image_url);
        read_required("Please enter captcha from above URL")
    }

    fn one_time_code(&self) -> Option<String> {
        read_required("Auth Code")
    }

    fn choose(&self, message: &str, options: &[String]) -> Option<usize> {
        choose(message, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_choice() {
        assert_eq!(parse_choice("1", 3), Some(0));
        assert_eq!(parse_choice(" 3 ", 3), Some(2));
        assert_eq!(parse_choice("0", 3), None);
        assert_eq!(parse_choice("4", 3), None);
        assert_eq!(parse_choice("two", 3), None);
    }

    #[test]
    fn test_empty_menu_has_no_choice() {
        assert_eq!(choose("Pick", &[]), None);
    }
}
