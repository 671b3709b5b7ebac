//! Arguments of `launch` and `attach` requests.

use crate::session::format::{DisplayFormat, ShowDisassembly};
use serde::Deserialize;
use std::collections::BTreeMap;
use strum_macros::{Display, EnumString};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, EnumString, Display)]
#[serde(rename_all = "lowercase")]
pub enum TerminalKind {
    #[default]
    #[strum(serialize = "console")]
    Console,
    #[strum(serialize = "integrated")]
    Integrated,
    #[strum(serialize = "external")]
    External,
}

/// `stdio` launch key.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum StdioSpec {
    Single(Option<String>),
    List(Vec<Option<String>>),
    Map {
        #[serde(default)]
        stdin: Option<String>,
        #[serde(default)]
        stdout: Option<String>,
        #[serde(default)]
        stderr: Option<String>,
    },
}

impl StdioSpec {
    /// Redirections for stdin, stdout and stderr.
    ///
    /// A single value applies to all three streams. A list shorter than three entries is padded
    /// with `None`. An object fills a missing entry from the previous one, left to right.
    pub fn resolve(&self) -> [Option<String>; 3] {
        match self {
            StdioSpec::Single(value) => [value.clone(), value.clone(), value.clone()],
            StdioSpec::List(items) => {
                let mut out: [Option<String>; 3] = Default::default();
                for (slot, item) in out.iter_mut().zip(items.iter()) {
                    *slot = item.clone();
                }
                out
            }
            StdioSpec::Map {
                stdin,
                stdout,
                stderr,
            } => {
                let stdout = stdout.clone().or_else(|| stdin.clone());
                let stderr = stderr.clone().or_else(|| stdout.clone());
                [stdin.clone(), stdout, stderr]
            }
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonArguments {
    #[serde(default)]
    pub init_commands: Vec<String>,
    #[serde(default)]
    pub pre_run_commands: Vec<String>,
    #[serde(default)]
    pub post_run_commands: Vec<String>,
    #[serde(default)]
    pub exit_commands: Vec<String>,
    #[serde(default)]
    pub source_languages: Option<Vec<String>>,
    #[serde(default)]
    pub stop_on_entry: bool,
    #[serde(default)]
    pub display_format: Option<DisplayFormat>,
    #[serde(default)]
    pub show_disassembly: Option<ShowDisassembly>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchArguments {
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub stdio: Option<StdioSpec>,
    #[serde(default)]
    pub terminal: TerminalKind,
    #[serde(default)]
    pub no_debug: bool,
    #[serde(flatten)]
    pub common: CommonArguments,
}

/// `pid` may arrive as a number or as a numeric string (from `${command:pickProcess}`).
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Pid {
    Number(u32),
    Text(String),
}

impl Pid {
    pub fn value(&self) -> Option<u32> {
        match self {
            Pid::Number(n) => Some(*n),
            Pid::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachArguments {
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub pid: Option<Pid>,
    #[serde(default)]
    pub wait_for: bool,
    #[serde(flatten)]
    pub common: CommonArguments,
}
