//! Pre-execution source validator.
//!
//! The V8 isolate is the real boundary. These checks bound the size of what
//! reaches it and reject the few patterns that only make sense as attempts to
//! reach the headless runtime underneath the window environment.

use crate::error::SandboxError;

/// Maximum size of a single source part in bytes (64 KB).
pub const DEFAULT_MAX_CODE_SIZE: usize = 64 * 1024;

/// Patterns that are banned from sandboxed source.
///
/// Candidates write browser code, so none of these has a legitimate use.
const BANNED_PATTERNS: &[&str] = &[
    "Deno.",         // Runtime escape
    "Deno[",         // Runtime escape via bracket access
    "__bootstrap",   // Runtime internals
    "Symbol.for('sandpit.",
    "Symbol.for(\"sandpit.",
];

/// Validates one part of a source bundle before it is embedded or executed.
///
/// Empty source is accepted: a preview of markup without a script is valid.
pub fn validate_source(
    part: &'static str,
    source: &str,
    max_size: Option<usize>,
) -> Result<(), SandboxError> {
    let max = max_size.unwrap_or(DEFAULT_MAX_CODE_SIZE);

    if source.len() > max {
        return Err(SandboxError::CodeTooLarge {
            part,
            max,
            actual: source.len(),
        });
    }

    if source.contains('\0') {
        return Err(SandboxError::ValidationFailed {
            reason: format!("{part} contains a NUL byte"),
        });
    }

    for pattern in BANNED_PATTERNS {
        if source.contains(pattern) {
            return Err(SandboxError::BannedPattern {
                pattern: (*pattern).to_string(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_component() {
        let code = r#"function Counter() { const [n, setN] = React.useState(0); return <b>{n}</b>; }"#;
        assert!(validate_source("script", code, None).is_ok());
    }

    #[test]
    fn accepts_empty_source() {
        assert!(validate_source("script", "", None).is_ok());
    }

    #[test]
    fn rejects_oversized_source() {
        let big = "x".repeat(100_000);
        let err = validate_source("script", &big, None).unwrap_err();
        assert!(matches!(err, SandboxError::CodeTooLarge { part: "script", .. }));
    }

    #[test]
    fn rejects_deno_access() {
        let code = r#"Deno.core.ops.op_sandpit_post_message("{}", "*");"#;
        let err = validate_source("script", code, None).unwrap_err();
        assert!(matches!(err, SandboxError::BannedPattern { .. }));
    }

    #[test]
    fn rejects_host_hook_lookup() {
        let code = r#"globalThis[Symbol.for('sandpit.host')].setResult("{}");"#;
        let err = validate_source("script", code, None).unwrap_err();
        assert!(matches!(err, SandboxError::BannedPattern { .. }));
    }

    #[test]
    fn rejects_nul_bytes() {
        let err = validate_source("markup", "<div>\0</div>", None).unwrap_err();
        assert!(matches!(err, SandboxError::ValidationFailed { .. }));
    }

    #[test]
    fn accepts_identifier_containing_deno() {
        // Only the member access is banned.
        let code = "const denoLike = 1; console.log(denoLike);";
        assert!(validate_source("script", code, None).is_ok());
    }

    #[test]
    fn custom_max_size() {
        let code = "x".repeat(100);
        assert!(validate_source("script", &code, Some(50)).is_err());
        assert!(validate_source("script", &code, Some(200)).is_ok());
    }
}
