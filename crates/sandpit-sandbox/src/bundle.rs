//! Run inputs: the source bundle and its execution mode.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Selects the document template, injected runtime libraries and discovery
/// heuristics for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Plain script operating on the markup it ships with.
    #[default]
    VanillaDom,
    /// JSX component mounted with the component framework runtime.
    ReactComponent,
    /// Logic-only script, evaluated through a controlled `new Function` call.
    PureLogic,
}

impl ExecutionMode {
    /// Wire name of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VanillaDom => "vanilla-dom",
            Self::ReactComponent => "react-component",
            Self::PureLogic => "pure-logic",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vanilla-dom" | "vanilla" => Ok(Self::VanillaDom),
            "react-component" | "react" => Ok(Self::ReactComponent),
            "pure-logic" | "logic" => Ok(Self::PureLogic),
            other => Err(format!(
                "unknown execution mode '{other}', expected vanilla-dom, react-component or pure-logic"
            )),
        }
    }
}

/// Immutable input to one run, produced by the host editor state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceBundle {
    /// Body markup.
    #[serde(default)]
    pub markup: String,
    /// Stylesheet text.
    #[serde(default)]
    pub styles: String,
    /// User-authored script.
    #[serde(default)]
    pub script: String,
    /// Execution mode.
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Template script defining `executeTest(input)` for the test harness.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_support: Option<String>,
}

impl SourceBundle {
    /// A bundle carrying only a script.
    pub fn script(mode: ExecutionMode, script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            mode,
            ..Default::default()
        }
    }

    /// Set the body markup.
    pub fn with_markup(mut self, markup: impl Into<String>) -> Self {
        self.markup = markup.into();
        self
    }

    /// Set the stylesheet.
    pub fn with_styles(mut self, styles: impl Into<String>) -> Self {
        self.styles = styles.into();
        self
    }

    /// Set the harness template.
    pub fn with_test_support(mut self, support: impl Into<String>) -> Self {
        self.test_support = Some(support.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_uses_kebab_case_on_the_wire() {
        let json = serde_json::to_string(&ExecutionMode::ReactComponent).unwrap();
        assert_eq!(json, "\"react-component\"");
        let mode: ExecutionMode = serde_json::from_str("\"pure-logic\"").unwrap();
        assert_eq!(mode, ExecutionMode::PureLogic);
    }

    #[test]
    fn mode_parses_short_names() {
        assert_eq!("react".parse::<ExecutionMode>(), Ok(ExecutionMode::ReactComponent));
        assert_eq!("vanilla-dom".parse::<ExecutionMode>(), Ok(ExecutionMode::VanillaDom));
        assert!("jquery".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn bundle_deserializes_with_defaults() {
        let bundle: SourceBundle =
            serde_json::from_str(r#"{"script":"console.log(1)","testSupport":"x"}"#).unwrap();
        assert_eq!(bundle.mode, ExecutionMode::VanillaDom);
        assert!(bundle.markup.is_empty());
        assert_eq!(bundle.test_support.as_deref(), Some("x"));
    }
}
