//! Language runtime entry points used by exception breakpoints.

use crate::engine::{BreakpointId, Engine, EngineResult};
use strum_macros::{Display, EnumString};

/// Exception filter offered to the client in `initialize`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ExceptionFilter {
    All,
    Uncaught,
}

impl ExceptionFilter {
    pub const ALL: [ExceptionFilter; 2] = [ExceptionFilter::All, ExceptionFilter::Uncaught];

    pub fn label(self) -> &'static str {
        match self {
            ExceptionFilter::All => "All exceptions",
            ExceptionFilter::Uncaught => "Uncaught exceptions",
        }
    }

    pub fn enabled_by_default(self) -> bool {
        matches!(self, ExceptionFilter::Uncaught)
    }
}

/// Where the engine should stop for an exception.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExceptionSite {
    /// Breakpoint on a runtime function.
    Symbol(&'static str),
    /// Engine native exception breakpoint of the language.
    Throw(&'static str),
}

impl ExceptionSite {
    pub fn create(self, engine: &mut dyn Engine) -> EngineResult<BreakpointId> {
        match self {
            ExceptionSite::Symbol(name) => engine.breakpoint_create_by_name(name),
            ExceptionSite::Throw(language) => {
                engine.breakpoint_create_for_exception(language, false, true)
            }
        }
    }
}

struct LanguageExceptions {
    names: &'static [&'static str],
    all: ExceptionSite,
    uncaught: ExceptionSite,
}

static REGISTRY: &[LanguageExceptions] = &[
    LanguageExceptions {
        names: &["rust"],
        all: ExceptionSite::Symbol("rust_panic"),
        uncaught: ExceptionSite::Symbol("abort"),
    },
    LanguageExceptions {
        names: &["cpp", "c++"],
        all: ExceptionSite::Throw("cpp"),
        uncaught: ExceptionSite::Symbol("terminate"),
    },
];

/// Languages used when neither the settings nor the launch configuration name any.
pub fn default_languages() -> Vec<String> {
    vec!["cpp".to_string()]
}

/// Exception site of `language` for `filter`, `None` for unknown languages.
pub fn exception_site(language: &str, filter: ExceptionFilter) -> Option<ExceptionSite> {
    let language = language.to_ascii_lowercase();
    let entry = REGISTRY.iter().find(|e| e.names.contains(&language.as_str()))?;
    Some(match filter {
        ExceptionFilter::All => entry.all,
        ExceptionFilter::Uncaught => entry.uncaught,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_registry() {
        assert_eq!(
            exception_site("rust", ExceptionFilter::All),
            Some(ExceptionSite::Symbol("rust_panic"))
        );
        assert_eq!(
            exception_site("Rust", ExceptionFilter::Uncaught),
            Some(ExceptionSite::Symbol("abort"))
        );
        assert_eq!(
            exception_site("c++", ExceptionFilter::All),
            Some(ExceptionSite::Throw("cpp"))
        );
        assert_eq!(
            exception_site("cpp", ExceptionFilter::Uncaught),
            Some(ExceptionSite::Symbol("terminate"))
        );
        assert_eq!(exception_site("cobol", ExceptionFilter::All), None);
    }

    #[test]
    fn test_filters() {
        assert_eq!("uncaught".parse::<ExceptionFilter>().unwrap(), ExceptionFilter::Uncaught);
        assert!("caught".parse::<ExceptionFilter>().is_err());
        assert_eq!(ExceptionFilter::All.to_string(), "all");
        assert!(!ExceptionFilter::All.enabled_by_default());
        assert_eq!(ExceptionFilter::All.label(), "All exceptions");
    }
}
