// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Abstract operator prompts so runs can be interactive or scripted.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fmt;
use std::io::{self, BufRead, Write};

use log::debug;

use crate::error::{HarnessError, HarnessResult};

/// Destructive actions that need operator consent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation<'a> {
    /// Remove working directories left over from an earlier run.
    ResetWorkingDirs {
        /// Application the directories belong to.
        app: &'a str,
        /// Number of directories present.
        count: usize,
    },
    /// Remove working directories at the end of this run.
    CleanupWorkingDirs {
        /// Number of directories present.
        count: usize,
    },
}

impl fmt::Display for Confirmation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confirmation::ResetWorkingDirs { app, count } => {
                write!(f, "Remove {count} existing {app} directories?")
            }
            Confirmation::CleanupWorkingDirs { count } => {
                write!(f, "Remove all {count} working directories?")
            }
        }
    }
}

/// Source of operator decisions during a run.
pub trait Operator {
    /// Ask for consent. Empty input counts as yes.
    fn confirm(&mut self, request: &Confirmation<'_>) -> HarnessResult<bool>;

    /// Block until the operator acknowledges `message`.
    fn acknowledge(&mut self, message: &str) -> HarnessResult<()>;
}

/// Line-oriented prompts on a reader/writer pair, normally stdin/stdout.
pub struct ConsoleOperator<R, W> {
    input: R,
    output: W,
}

impl ConsoleOperator<io::StdinLock<'static>, io::Stdout> {
    /// Prompt on the process terminal.
    #[must_use]
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stdout())
    }
}

impl<R: BufRead, W: Write> ConsoleOperator<R, W> {
    /// Prompt on an arbitrary reader/writer pair.
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn read_answer(&mut self) -> HarnessResult<Option<String>> {
        let mut line = String::new();
        let read = self
            .input
            .read_line(&mut line)
            .map_err(HarnessError::Prompt)?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_ascii_lowercase()))
    }
}

impl<R: BufRead, W: Write> Operator for ConsoleOperator<R, W> {
    fn confirm(&mut self, request: &Confirmation<'_>) -> HarnessResult<bool> {
        write!(self.output, "{request} [Y/n] ").map_err(HarnessError::Prompt)?;
        self.output.flush().map_err(HarnessError::Prompt)?;
        // EOF means nobody is there to answer; never treat it as consent.
        let answer = match self.read_answer()? {
            Some(answer) => matches!(answer.as_str(), "" | "y" | "yes"),
            None => false,
        };
        debug!("operator answered {answer} to {request:?}");
        Ok(answer)
    }

    fn acknowledge(&mut self, message: &str) -> HarnessResult<()> {
        write!(self.output, "{message} Press [Enter] to continue...")
            .map_err(HarnessError::Prompt)?;
        self.output.flush().map_err(HarnessError::Prompt)?;
        self.read_answer()?;
        Ok(())
    }
}

/// Non-interactive policy with a fixed answer per confirmation kind.
#[derive(Debug, Clone, Default)]
pub struct ScriptedOperator {
    reset: bool,
    cleanup: bool,
    asked: Vec<String>,
    acknowledged: usize,
}

impl ScriptedOperator {
    /// Answer `reset` to start-of-run resets and `cleanup` to the final offer.
    #[must_use]
    pub fn new(reset: bool, cleanup: bool) -> Self {
        Self {
            reset,
            cleanup,
            ..Self::default()
        }
    }

    /// Answer yes to everything.
    #[must_use]
    pub fn always_yes() -> Self {
        Self::new(true, true)
    }

    /// Answer no to everything.
    #[must_use]
    pub fn always_no() -> Self {
        Self::new(false, false)
    }

    /// Questions asked so far, rendered.
    #[must_use]
    pub fn asked(&self) -> &[String] {
        &self.asked
    }

    /// Number of acknowledgements requested so far.
    #[must_use]
    pub fn acknowledged(&self) -> usize {
        self.acknowledged
    }
}

impl Operator for ScriptedOperator {
    fn confirm(&mut self, request: &Confirmation<'_>) -> HarnessResult<bool> {
        self.asked.push(request.to_string());
        Ok(match request {
            Confirmation::ResetWorkingDirs { .. } => self.reset,
            Confirmation::CleanupWorkingDirs { .. } => self.cleanup,
        })
    }

    fn acknowledge(&mut self, _message: &str) -> HarnessResult<()> {
        self.acknowledged += 1;
        Ok(())
    }
}

/// Wraps another operator and answers the final cleanup offer itself.
pub struct KeepWorkingDirs<O> {
    inner: O,
}

impl<O: Operator> KeepWorkingDirs<O> {
    /// Decline the cleanup offer; defer everything else to `inner`.
    pub fn new(inner: O) -> Self {
        Self { inner }
    }
}

impl<O: Operator> Operator for KeepWorkingDirs<O> {
    fn confirm(&mut self, request: &Confirmation<'_>) -> HarnessResult<bool> {
        match request {
            Confirmation::CleanupWorkingDirs { .. } => Ok(false),
            other => self.inner.confirm(other),
        }
    }

    fn acknowledge(&mut self, message: &str) -> HarnessResult<()> {
        self.inner.acknowledge(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLEANUP: Confirmation<'static> = Confirmation::CleanupWorkingDirs { count: 3 };

    fn answer(input: &str) -> bool {
        let mut out = Vec::new();
        let mut operator = ConsoleOperator::new(input.as_bytes(), &mut out);
        operator.confirm(&CLEANUP).unwrap()
    }

    #[test]
    fn empty_and_affirmative_input_confirm() {
        assert!(answer("\n"));
        assert!(answer("y\n"));
        assert!(answer("  YES \n"));
    }

    #[test]
    fn other_input_and_eof_decline() {
        assert!(!answer("n\n"));
        assert!(!answer("later\n"));
        assert!(!answer(""));
    }

    #[test]
    fn acknowledge_consumes_one_line() {
        let mut out = Vec::new();
        let mut operator = ConsoleOperator::new("\nn\n".as_bytes(), &mut out);
        operator.acknowledge("Close the app.").unwrap();
        assert!(!operator.confirm(&CLEANUP).unwrap());
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Close the app. Press [Enter]"));
        assert!(text.contains("Remove all 3 working directories? [Y/n]"));
    }

    #[test]
    fn scripted_answers_by_kind() {
        let mut operator = ScriptedOperator::new(true, false);
        let reset = Confirmation::ResetWorkingDirs { app: "my_app", count: 2 };
        assert!(operator.confirm(&reset).unwrap());
        assert!(!operator.confirm(&CLEANUP).unwrap());
        assert_eq!(operator.asked().len(), 2);
        assert_eq!(operator.asked()[0], "Remove 2 existing my_app directories?");
    }

    #[test]
    fn keep_declines_cleanup_only() {
        let mut operator = KeepWorkingDirs::new(ScriptedOperator::always_yes());
        let reset = Confirmation::ResetWorkingDirs { app: "my_app", count: 1 };
        assert!(operator.confirm(&reset).unwrap());
        assert!(!operator.confirm(&CLEANUP).unwrap());
    }
}
