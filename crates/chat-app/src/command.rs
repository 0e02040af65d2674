use std::path::PathBuf;

use snafu::{OptionExt, ResultExt, Snafu, ensure};

/// One line of REPL input. Message indices are 1-based positions in the visible conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    Regenerate,
    Edit { index: usize, text: String },
    Branch { index: usize, text: String },
    Versions { index: usize },
    Switch { branch: String },
    Prune { branch: String },
    Path,
    Stop,
    Attach { path: PathBuf },
    New { title: Option<String> },
    Chats,
    Open { index: usize },
    Rename { title: String },
    Delete,
    Export { path: PathBuf },
    Import { path: PathBuf },
    Help,
    Quit,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CommandError {
    #[snafu(display("unknown command `/{name}`, try /help"))]
    UnknownCommand { stage: &'static str, name: String },
    #[snafu(display("`/{command}` needs {argument}"))]
    MissingArgument {
        stage: &'static str,
        command: &'static str,
        argument: &'static str,
    },
    #[snafu(display("`{raw}` is not a message number"))]
    InvalidIndex {
        stage: &'static str,
        raw: String,
        source: std::num::ParseIntError,
    },
    #[snafu(display("message numbers start at 1"))]
    ZeroIndex { stage: &'static str },
}

pub type CommandResult<T> = Result<T, CommandError>;

pub const HELP_TEXT: &str = "\
commands:
  <text>              send a message
  /regen              regenerate the last reply
  /edit N TEXT        edit message N in place and regenerate its reply
  /branch N TEXT      add TEXT as a new version of message N
  /versions N         list the versions of message N
  /switch BRANCH      switch to a branch
  /prune BRANCH       delete a branch and its messages
  /path               show the active branch path
  /stop               pause the running reply
  /attach PATH        upload a file for the next message
  /new [TITLE]        start a new chat
  /chats              list chats
  /open N             open chat N from /chats
  /rename TITLE       rename the current chat
  /delete             delete the current chat
  /export PATH        export all chats as JSON
  /import PATH        import chats from JSON
  /quit               exit";

impl Command {
    /// `None` for blank input.
    pub fn parse(line: &str) -> CommandResult<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let Some(body) = line.strip_prefix('/') else {
            return Ok(Some(Self::Send(line.to_string())));
        };

        let (name, rest) = match body.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (body, ""),
        };

        let command = match name {
            "regen" | "regenerate" => Self::Regenerate,
            "edit" => {
                let (index, text) = index_and_text("edit", rest)?;
                Self::Edit { index, text }
            }
            "branch" => {
                let (index, text) = index_and_text("branch", rest)?;
                Self::Branch { index, text }
            }
            "versions" => Self::Versions {
                index: parse_index(required("versions", "a message number", rest)?)?,
            },
            "switch" => Self::Switch {
                branch: required("switch", "a branch id", rest)?.to_string(),
            },
            "prune" => Self::Prune {
                branch: required("prune", "a branch id", rest)?.to_string(),
            },
            "path" => Self::Path,
            "stop" | "pause" => Self::Stop,
            "attach" => Self::Attach {
                path: PathBuf::from(required("attach", "a file path", rest)?),
            },
            "new" => Self::New {
                title: (!rest.is_empty()).then(|| rest.to_string()),
            },
            "chats" => Self::Chats,
            "open" => Self::Open {
                index: parse_index(required("open", "a chat number", rest)?)?,
            },
            "rename" => Self::Rename {
                title: required("rename", "a title", rest)?.to_string(),
            },
            "delete" => Self::Delete,
            "export" => Self::Export {
                path: PathBuf::from(required("export", "a file path", rest)?),
            },
            "import" => Self::Import {
                path: PathBuf::from(required("import", "a file path", rest)?),
            },
            "help" | "?" => Self::Help,
            "quit" | "exit" | "q" => Self::Quit,
            other => {
                return UnknownCommandSnafu {
                    stage: "parse-command",
                    name: other.to_string(),
                }
                .fail();
            }
        };
        Ok(Some(command))
    }
}

fn required<'a>(
    command: &'static str,
    argument: &'static str,
    rest: &'a str,
) -> CommandResult<&'a str> {
    (!rest.is_empty()).then_some(rest).context(MissingArgumentSnafu {
        stage: "parse-argument",
        command,
        argument,
    })
}

fn index_and_text(command: &'static str, rest: &str) -> CommandResult<(usize, String)> {
    let (raw_index, text) = rest
        .split_once(char::is_whitespace)
        .map(|(index, text)| (index, text.trim()))
        .unwrap_or((rest, ""));
    let index = parse_index(required(command, "a message number", raw_index)?)?;
    let text = required(command, "the new text", text)?;
    Ok((index, text.to_string()))
}

fn parse_index(raw: &str) -> CommandResult<usize> {
    let index = raw.parse::<usize>().context(InvalidIndexSnafu {
        stage: "parse-index",
        raw: raw.to_string(),
    })?;
    ensure!(index > 0, ZeroIndexSnafu { stage: "parse-index" });
    Ok(index)
}
