//! User interaction.

use std::io::{self, BufRead, Write};

/// Where search results are shown and selections are read from.
pub trait Terminal {
    /// Shows `s`.
    fn write_str(&mut self, s: &str) -> io::Result<()>;

    /// Shows `prompt` and reads one line of input.
    ///
    /// Returns `None` at the end of the input.  The line terminator
    /// is stripped.
    fn prompt(&mut self, prompt: &str) -> io::Result<Option<String>>;
}

/// A [`Terminal`] on stdout and stdin.
#[derive(Debug, Default)]
pub struct StdTerminal {
    _private: (),
}

impl StdTerminal {
    /// Returns a terminal on stdout and stdin.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Terminal for StdTerminal {
    fn write_str(&mut self, s: &str) -> io::Result<()> {
        let mut stdout = io::stdout();
        stdout.write_all(s.as_bytes())?;
        stdout.flush()
    }

    fn prompt(&mut self, prompt: &str) -> io::Result<Option<String>> {
        self.write_str(prompt)?;
        read_line(&mut io::stdin().lock())
    }
}

fn read_line<R: BufRead>(input: &mut R) -> io::Result<Option<String>> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Some(line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines() {
        let mut input = io::Cursor::new(&b"1,2\r\nq\nlast"[..]);
        assert_eq!(read_line(&mut input).unwrap().as_deref(), Some("1,2"));
        assert_eq!(read_line(&mut input).unwrap().as_deref(), Some("q"));
        assert_eq!(read_line(&mut input).unwrap().as_deref(), Some("last"));
        assert_eq!(read_line(&mut input).unwrap(), None);
    }
}
