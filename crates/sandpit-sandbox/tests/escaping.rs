//! Property tests for embedding source text in generated documents.

use proptest::prelude::*;
use sandpit_sandbox::document::ScriptBlock;
use sandpit_sandbox::escape::{escape_js_string, unescape_js_string};
use sandpit_sandbox::{transform, Capabilities, DocumentBuilder, ExecutionMode, SourceBundle};

const LITERAL_START: &str = "var source = \"";
const LITERAL_END: &str = "\";\n";

/// Characters that need escaping, mixed with ordinary text.
fn tricky_source() -> impl Strategy<Value = String> {
    prop::collection::vec(
        prop_oneof![
            Just("\\".to_string()),
            Just("\"".to_string()),
            Just("'".to_string()),
            Just("`".to_string()),
            Just("\n".to_string()),
            Just("\r\n".to_string()),
            Just("</script>".to_string()),
            Just("\u{2028}".to_string()),
            Just("${x}".to_string()),
            "[a-zA-Z0-9 (){};=.]{0,8}",
        ],
        0..40,
    )
    .prop_map(|parts| parts.concat())
}

fn extract_literal(script: &str) -> &str {
    let start = script.find(LITERAL_START).expect("literal start") + LITERAL_START.len();
    let len = script[start..].find(LITERAL_END).expect("literal end");
    &script[start..start + len]
}

proptest! {
    #[test]
    fn escape_round_trips(source in tricky_source()) {
        prop_assert_eq!(unescape_js_string(&escape_js_string(&source)), source);
    }

    #[test]
    fn escaped_text_never_closes_the_script(source in tricky_source()) {
        let escaped = escape_js_string(&source);
        prop_assert!(!escaped.contains("</"));
        prop_assert!(!escaped.contains('\n'));
        let line_separator = '\u{2028}';
        prop_assert!(!escaped.contains(line_separator));
    }

    #[test]
    fn pure_logic_document_embeds_source_exactly(source in tricky_source()) {
        let bundle = SourceBundle::script(ExecutionMode::PureLogic, source.clone());
        let document = DocumentBuilder::default()
            .build(&bundle, Capabilities::live_preview())
            .unwrap();

        let user = document
            .scripts()
            .iter()
            .find_map(|block| match block {
                ScriptBlock::Inline { label: "user", source, .. } => Some(source.as_str()),
                _ => None,
            })
            .expect("user script");
        let embedded = extract_literal(user);
        prop_assert_eq!(
            unescape_js_string(embedded),
            transform(&source, ExecutionMode::PureLogic)
        );
        prop_assert!(document.render().contains(embedded));
    }
}
