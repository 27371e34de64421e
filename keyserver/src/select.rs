//! Lets the user pick search results for retrieval.

use log::warn;

use crate::{Descriptor, Error, Result};
use crate::driver::{Retrieved, RetrievalDriver};
use crate::search::SearchContext;
use crate::terminal::Terminal;

/// Largest number of keys that can be selected at once.
pub const MAX_SELECTIONS: usize = 50;

/// The selection prompt.
pub const PROMPT: &str = "Enter number(s), N)ext, or Q)uit > ";

/// What the user asked for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Choice {
    /// Show more results.
    Next,
    /// End the search.
    Quit,
    /// Retrieve the records with these 1-based numbers.
    Select(Vec<usize>),
}

/// The result of an interactive step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selection {
    /// Nothing was selected, continue listing.
    Next,
    /// The user quit.
    Canceled,
    /// The selected keys were retrieved.
    Retrieved(Retrieved),
}

/// Parses the user's answer to the selection prompt.
///
/// `numdesc` is the number of records shown so far.  Returns
/// `Ok(None)` if the answer selects nothing and the user should be
/// asked again, and [`Error::TooManySelections`] if more than
/// [`MAX_SELECTIONS`] records were selected.
pub fn parse_selection(answer: Option<&str>, numdesc: usize)
                       -> Result<Option<Choice>>
{
    let answer = match answer {
        Some(a) if ! a.starts_with('\x04') => a,
        // End of input or control-d.
        _ => return Ok(Some(Choice::Quit)),
    };

    match answer.chars().next() {
        Some('q') | Some('Q') => return Ok(Some(Choice::Quit)),
        Some('n') | Some('N') | None => return Ok(Some(Choice::Next)),
        _ => (),
    }

    let mut selected = Vec::new();
    for token in answer.split(|c: char| c == ' ' || c == ',') {
        let n = match token.parse::<usize>() {
            Ok(n) if n >= 1 && n <= numdesc => n,
            _ => continue,
        };
        if selected.len() == MAX_SELECTIONS {
            return Err(Error::TooManySelections(MAX_SELECTIONS).into());
        }
        selected.push(n);
    }

    if selected.is_empty() {
        Ok(None)
    } else {
        Ok(Some(Choice::Select(selected)))
    }
}

/// Shows the selection prompt and acts on the answer.
#[derive(Debug)]
pub struct InteractiveSelector {
    from: usize,
}

impl Default for InteractiveSelector {
    fn default() -> Self {
        InteractiveSelector { from: 1 }
    }
}

impl InteractiveSelector {
    /// Returns a selector for a new search.
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the user which of `descriptors` to retrieve.
    ///
    /// `count` is the number of results the server announced, if it
    /// can be trusted; `search` is the search string.
    pub fn prompt(&mut self, terminal: &mut dyn Terminal,
                  descriptors: &[Descriptor], count: Option<usize>,
                  search: &str)
                  -> Result<Choice>
    {
        let progress = match count {
            Some(count) => format!("Keys {}-{} of {} for \"{}\".  ",
                                   self.from, descriptors.len(), count, search),
            None => format!("Keys {}-{} for \"{}\".  ",
                            self.from, descriptors.len(), search),
        };
        terminal.write_str(&progress)?;
        self.from = descriptors.len() + 1;

        loop {
            let answer = terminal.prompt(PROMPT)?;
            if answer.as_deref().map(|a| a.starts_with('\x04')).unwrap_or(false) {
                terminal.write_str("Q\n")?;
            }

            match parse_selection(answer.as_deref(), descriptors.len()) {
                Ok(Some(choice)) => return Ok(choice),
                Ok(None) => continue,
                Err(e) => match e.downcast_ref::<Error>() {
                    Some(Error::TooManySelections(_)) => {
                        warn!("{}", e);
                        terminal.write_str("Too many keys selected\n")?;
                    },
                    _ => return Err(e),
                },
            }
        }
    }

    /// Asks the user which of `descriptors` to retrieve, and
    /// retrieves them.
    ///
    /// Selected keys are fetched from the configured keyservers.
    pub fn run(&mut self, ctx: &mut SearchContext,
               descriptors: &[Descriptor], count: Option<usize>,
               search: &str)
               -> Result<Selection>
    {
        match self.prompt(ctx.terminal, descriptors, count, search)? {
            Choice::Next => Ok(Selection::Next),
            Choice::Quit => Ok(Selection::Canceled),
            Choice::Select(numbers) => {
                let selected: Vec<Descriptor> = numbers.into_iter()
                    .map(|n| descriptors[n - 1].clone())
                    .collect();
                let retrieved =
                    RetrievalDriver::new(ctx.transport, ctx.importer)
                    .get(&selected, None, false)?;
                Ok(Selection::Retrieved(retrieved))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTerminal;

    #[test]
    fn selections() {
        assert_eq!(parse_selection(Some("1,3,99"), 3).unwrap(),
                   Some(Choice::Select(vec![1, 3])));
        assert_eq!(parse_selection(Some("2 1"), 3).unwrap(),
                   Some(Choice::Select(vec![2, 1])));
        assert_eq!(parse_selection(Some("0,4,x"), 3).unwrap(), None);
        assert_eq!(parse_selection(Some(" , "), 3).unwrap(), None);
    }

    #[test]
    fn navigation() {
        assert_eq!(parse_selection(Some("q"), 3).unwrap(), Some(Choice::Quit));
        assert_eq!(parse_selection(Some("Quit"), 3).unwrap(),
                   Some(Choice::Quit));
        assert_eq!(parse_selection(Some("\x04"), 3).unwrap(),
                   Some(Choice::Quit));
        assert_eq!(parse_selection(None, 3).unwrap(), Some(Choice::Quit));
        assert_eq!(parse_selection(Some(""), 3).unwrap(), Some(Choice::Next));
        assert_eq!(parse_selection(Some("N"), 3).unwrap(), Some(Choice::Next));
    }

    #[test]
    fn too_many() {
        let answer = vec!["1"; 51].join(",");
        let err = parse_selection(Some(&answer), 1).unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::TooManySelections(50)) => (),
            e => panic!("unexpected error: {:?}", e),
        }

        let answer = vec!["1"; 50].join(",");
        assert_eq!(parse_selection(Some(&answer), 1).unwrap(),
                   Some(Choice::Select(vec![1; 50])));
    }

    #[test]
    fn prompt_until_something_is_selected() {
        let mut terminal = ScriptedTerminal::new(vec!["7", "1,2"]);
        let d = vec![Descriptor::ShortKeyID(1), Descriptor::ShortKeyID(2)];

        let mut selector = InteractiveSelector::new();
        let choice = selector.prompt(&mut terminal, &d, Some(5), "alice")
            .unwrap();
        assert_eq!(choice, Choice::Select(vec![1, 2]));
        assert_eq!(terminal.prompts, vec![PROMPT, PROMPT]);
        assert_eq!(terminal.output, "Keys 1-2 of 5 for \"alice\".  ");
    }

    #[test]
    fn progress_continues() {
        let mut terminal = ScriptedTerminal::new(vec!["n", "n"]);
        let d = vec![Descriptor::ShortKeyID(1); 4];

        let mut selector = InteractiveSelector::new();
        selector.prompt(&mut terminal, &d[..2], None, "bob").unwrap();
        selector.prompt(&mut terminal, &d, None, "bob").unwrap();
        assert_eq!(terminal.output,
                   "Keys 1-2 for \"bob\".  Keys 3-4 for \"bob\".  ");
    }

    #[test]
    fn too_many_reprompts() {
        let answer = vec!["1"; 51].join(",");
        let mut terminal = ScriptedTerminal::new(vec![answer.as_str(), "q"]);
        let d = vec![Descriptor::ShortKeyID(1)];

        let choice = InteractiveSelector::new()
            .prompt(&mut terminal, &d, None, "x").unwrap();
        assert_eq!(choice, Choice::Quit);
        assert!(terminal.output.contains("Too many keys selected\n"));
    }

    #[test]
    fn control_d() {
        let mut terminal = ScriptedTerminal::new(vec!["\x04"]);
        let d = vec![Descriptor::ShortKeyID(1)];
        let choice = InteractiveSelector::new()
            .prompt(&mut terminal, &d, None, "x").unwrap();
        assert_eq!(choice, Choice::Quit);
        assert!(terminal.output.ends_with("Q\n"));
    }
}
