use crate::{MigrunError, Result};
use std::io::{self, BufRead, ErrorKind, Stdin, StdinLock, Stdout, Write};

/// Asks the operator a yes/no question.
pub trait Confirm {
    fn confirm(&mut self, question: &str) -> Result<bool>;
}

/// Blocking yes/no prompt. Anything other than `yes` or `no` (any case) asks again.
pub struct ConsolePrompt<R, W> {
    input: R,
    output: W,
}

impl ConsolePrompt<StdinLock<'static>, Stdout> {
    pub fn stdio() -> Self {
        let stdin: Stdin = io::stdin();
        Self::new(stdin.lock(), io::stdout())
    }
}

impl<R: BufRead, W: Write> ConsolePrompt<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    pub fn into_output(self) -> W {
        self.output
    }
}

impl<R: BufRead, W: Write> Confirm for ConsolePrompt<R, W> {
    fn confirm(&mut self, question: &str) -> Result<bool> {
        loop {
            write!(self.output, "{} [yes/no]: ", question).map_err(MigrunError::Prompt)?;
            self.output.flush().map_err(MigrunError::Prompt)?;

            let mut answer = String::new();
            let read = self
                .input
                .read_line(&mut answer)
                .map_err(MigrunError::Prompt)?;
            if read == 0 {
                return Err(MigrunError::Prompt(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "no answer given before end of input",
                )));
            }

            match answer.trim().to_ascii_lowercase().as_str() {
                "yes" => return Ok(true),
                "no" => return Ok(false),
                _ => writeln!(self.output, "Please answer yes or no.").map_err(MigrunError::Prompt)?,
            }
        }
    }
}
