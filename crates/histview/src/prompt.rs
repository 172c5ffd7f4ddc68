//! Terminal credential prompt.

use std::io::{self, BufRead, Write};

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use crossterm::tty::IsTty;
use histview_core::services::CredentialPrompt;
use histview_core::Credentials;

/// Asks for a user name and password on the terminal.
///
/// An empty user name, Esc, Ctrl-C or a closed stdin cancels. The password
/// is not echoed when stdin is a terminal.
#[derive(Debug, Default)]
pub struct TerminalPrompt;

/// State of a hidden entry after one key.
#[derive(Debug, PartialEq, Eq)]
enum Entry {
    Typing,
    Done,
    Cancelled,
}

impl TerminalPrompt {
    fn read_line(label: &str) -> Option<String> {
        eprint!("{label}: ");
        io::stderr().flush().ok()?;

        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
        }
    }

    fn read_password(label: &str) -> Option<String> {
        if !io::stdin().is_tty() {
            return Self::read_line(label);
        }

        eprint!("{label}: ");
        io::stderr().flush().ok()?;
        enable_raw_mode().ok()?;
        let password = Self::read_hidden();
        if let Err(e) = disable_raw_mode() {
            tracing::warn!(error = %e, "Failed to leave raw terminal mode");
        }
        eprintln!();
        password
    }

    fn read_hidden() -> Option<String> {
        let mut password = String::new();
        loop {
            let Event::Key(key) = event::read().ok()? else {
                continue;
            };
            match apply_key(&mut password, key) {
                Entry::Typing => {}
                Entry::Done => return Some(password),
                Entry::Cancelled => return None,
            }
        }
    }
}

fn apply_key(buffer: &mut String, key: KeyEvent) -> Entry {
    if key.kind == KeyEventKind::Release {
        return Entry::Typing;
    }
    match key.code {
        KeyCode::Enter => Entry::Done,
        KeyCode::Esc => Entry::Cancelled,
        KeyCode::Char('c' | 'd') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            Entry::Cancelled
        }
        KeyCode::Backspace => {
            buffer.pop();
            Entry::Typing
        }
        KeyCode::Char(c) => {
            buffer.push(c);
            Entry::Typing
        }
        _ => Entry::Typing,
    }
}

impl CredentialPrompt for TerminalPrompt {
    fn prompt(&self, domain: &str, error_text: &str) -> Option<Credentials> {
        eprintln!("Authentication failed for {domain}");
        if !error_text.is_empty() {
            eprintln!("  {error_text}");
        }

        let user = Self::read_line("User").filter(|u| !u.is_empty())?;
        let password = Self::read_password("Password")?;
        Some(Credentials::new(user, password))
    }
}
