//! Source normalisation before a run, plus best-effort identifier lookups.
//!
//! Everything here is text-pattern matching, not parsing. Import statements
//! spanning several lines, or statements reordered around comments, may
//! survive the transform. That is accepted: a statement that is not stripped
//! only degrades to "runs literally" and the transform itself never fails.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

use crate::bundle::ExecutionMode;

/// Single-line imports of the component framework or its DOM renderer.
static FRAMEWORK_IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)^[ \t]*import[ \t]+[^;\n'"]+?[ \t]+from[ \t]*['"](?:react|react-dom|react-dom/client)['"][ \t]*;?[ \t]*\r?(?:\n|$)"#,
    )
    .unwrap()
});

/// A trailing `export default Identifier;` statement.
static TRAILING_EXPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\n)[ \t]*export[ \t]+default[ \t]+([A-Za-z_$][A-Za-z0-9_$]*)[ \t]*;?\s*\z")
        .unwrap()
});

static DECLARED_FN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bfunction\s*\*?\s*([A-Za-z_$][A-Za-z0-9_$]*)\s*\(").unwrap()
});

static ASSIGNED_FN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:const|let|var)\s+([A-Za-z_$][A-Za-z0-9_$]*)\s*=\s*(?:async\s+)?(?:function\b|(?:\([^)]*\)|[A-Za-z_$][A-Za-z0-9_$]*)\s*=>)",
    )
    .unwrap()
});

/// Title keywords mapped to the function name conventionally used by the
/// matching question boilerplate.
const TITLE_KEYWORDS: &[(&str, &str)] = &[
    ("two sum", "twoSum"),
    ("palindrome", "isPalindrome"),
    ("anagram", "isAnagram"),
    ("reverse", "reverseString"),
    ("fizzbuzz", "fizzBuzz"),
    ("fizz buzz", "fizzBuzz"),
    ("fibonacci", "fibonacci"),
    ("factorial", "factorial"),
    ("max subarray", "maxSubArray"),
    ("maximum subarray", "maxSubArray"),
    ("valid parentheses", "isValid"),
    ("binary search", "binarySearch"),
];

/// Outcome of a best-effort identifier lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// An identifier was recognised.
    Found(String),
    /// No pattern matched.
    NotFound,
}

impl Lookup {
    /// The identifier, if one was found.
    pub fn identifier(&self) -> Option<&str> {
        match self {
            Self::Found(name) => Some(name),
            Self::NotFound => None,
        }
    }
}

/// Transformed source together with what the transform recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transformed {
    /// Source ready for embedding.
    pub source: String,
    /// Identifier of a stripped trailing `export default` statement.
    pub default_export: Lookup,
}

/// Normalises user source for `mode`.
///
/// Never fails; on input it does not recognise the source comes back as is.
pub fn transform(source: &str, mode: ExecutionMode) -> String {
    transform_detailed(source, mode).source
}

/// Like [`transform`], also reporting the stripped default export.
pub fn transform_detailed(source: &str, mode: ExecutionMode) -> Transformed {
    match mode {
        ExecutionMode::ReactComponent => {
            let without_imports = FRAMEWORK_IMPORT_RE.replace_all(source, "");
            let (source, default_export) = strip_trailing_export(without_imports);
            Transformed {
                source,
                default_export,
            }
        }
        ExecutionMode::VanillaDom | ExecutionMode::PureLogic => Transformed {
            source: source.to_string(),
            default_export: Lookup::NotFound,
        },
    }
}

fn strip_trailing_export(source: Cow<'_, str>) -> (String, Lookup) {
    let Some(caps) = TRAILING_EXPORT_RE.captures(&source) else {
        return (source.into_owned(), Lookup::NotFound);
    };
    let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
        return (source.into_owned(), Lookup::NotFound);
    };
    let name = name.as_str().to_string();
    let mut stripped = source[..whole.start()].to_string();
    stripped.push('\n');
    (stripped, Lookup::Found(name))
}

/// How the callable under test was identified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionLookup {
    /// `function name(`
    Declared(String),
    /// `const|let|var name = (...) =>` or `= function`
    Assigned(String),
    /// Guessed from the question title and confirmed present in the source.
    TitleHeuristic(String),
    /// Nothing matched.
    NotFound,
}

impl FunctionLookup {
    /// The function name, if one was identified.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Declared(name) | Self::Assigned(name) | Self::TitleHeuristic(name) => Some(name),
            Self::NotFound => None,
        }
    }
}

/// Finds the function a plain-function test should call.
///
/// Tries, in order: an explicit `function name(` declaration, a
/// `const/let/var name = ... =>` assignment, then names derived from
/// `question_title` that actually occur in `source`.
pub fn find_function_name(source: &str, question_title: &str) -> FunctionLookup {
    if let Some(name) = first_capture(&DECLARED_FN_RE, source) {
        return FunctionLookup::Declared(name);
    }
    if let Some(name) = first_capture(&ASSIGNED_FN_RE, source) {
        return FunctionLookup::Assigned(name);
    }

    let title = question_title.to_lowercase();
    for (keyword, name) in TITLE_KEYWORDS {
        if title.contains(keyword) && mentions_identifier(source, name) {
            return FunctionLookup::TitleHeuristic((*name).to_string());
        }
    }

    if let Some(name) = camel_case(question_title) {
        if mentions_identifier(source, &name) {
            return FunctionLookup::TitleHeuristic(name);
        }
    }

    FunctionLookup::NotFound
}

fn first_capture(re: &Regex, source: &str) -> Option<String> {
    re.captures(source)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn mentions_identifier(source: &str, name: &str) -> bool {
    let pattern = format!(r"(?:^|[^A-Za-z0-9_$]){}(?:$|[^A-Za-z0-9_$])", regex::escape(name));
    Regex::new(&pattern)
        .map(|re| re.is_match(source))
        .unwrap_or(false)
}

/// "Two Sum" -> "twoSum". `None` when the title has no usable words.
fn camel_case(title: &str) -> Option<String> {
    let mut words = title
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty());
    let first = words.next()?;
    if first.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    let mut name = first.to_ascii_lowercase();
    for word in words {
        let mut chars = word.chars();
        if let Some(head) = chars.next() {
            name.push(head.to_ascii_uppercase());
            name.push_str(&chars.as_str().to_ascii_lowercase());
        }
    }
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const COUNTER: &str = r#"import React, { useState } from 'react';
import ReactDOM from "react-dom/client";

function Counter() {
  const [count, setCount] = useState(0);
  return <button onClick={() => setCount(count + 1)}>{count}</button>;
}

export default Counter;
"#;

    #[test]
    fn strips_framework_imports_and_trailing_export() {
        let out = transform_detailed(COUNTER, ExecutionMode::ReactComponent);
        assert!(!out.source.contains("import"), "imports left: {}", out.source);
        assert!(!out.source.contains("export default"));
        assert!(out.source.contains("function Counter()"));
        assert_eq!(out.default_export, Lookup::Found("Counter".into()));
    }

    #[test]
    fn strips_named_and_namespace_imports() {
        let src = "import { useState, useEffect } from 'react'\nimport * as React from \"react\";\nconst x = 1;\n";
        assert_eq!(transform(src, ExecutionMode::ReactComponent), "const x = 1;\n");
    }

    #[test]
    fn keeps_unrelated_imports() {
        let src = "import _ from 'lodash';\nconst x = 1;\n";
        assert_eq!(transform(src, ExecutionMode::ReactComponent), src);
    }

    #[test]
    fn keeps_export_that_is_not_trailing() {
        let src = "export default App;\nconsole.log('after');\n";
        let out = transform_detailed(src, ExecutionMode::ReactComponent);
        assert_eq!(out.source, src);
        assert_eq!(out.default_export, Lookup::NotFound);
    }

    #[test]
    fn multi_line_import_is_a_known_limitation() {
        let src = "import {\n  useState\n} from 'react';\nconst x = 1;\n";
        // Not stripped: import matching is single-line.
        assert!(transform(src, ExecutionMode::ReactComponent).contains("useState"));
    }

    #[test]
    fn other_modes_pass_through() {
        assert_eq!(transform(COUNTER, ExecutionMode::VanillaDom), COUNTER);
        assert_eq!(transform(COUNTER, ExecutionMode::PureLogic), COUNTER);
    }

    #[test]
    fn finds_declared_function_first() {
        let src = "const helper = (x) => x;\nfunction twoSum(nums, target) { return []; }";
        assert_eq!(
            find_function_name(src, "Two Sum"),
            FunctionLookup::Declared("twoSum".into())
        );
    }

    #[test]
    fn finds_arrow_assignment() {
        let src = "const reverseWords = async (s) => s.split(' ').reverse().join(' ');";
        assert_eq!(
            find_function_name(src, ""),
            FunctionLookup::Assigned("reverseWords".into())
        );
        let src = "let add = a => a + 1;";
        assert_eq!(find_function_name(src, ""), FunctionLookup::Assigned("add".into()));
        let src = "var mul = function (a, b) { return a * b; };";
        assert_eq!(find_function_name(src, ""), FunctionLookup::Assigned("mul".into()));
    }

    #[test]
    fn falls_back_to_title_keywords() {
        let src = "exports.isPalindrome = s => s === [...s].reverse().join('');\nisPalindrome;";
        assert_eq!(
            find_function_name(src, "Valid Palindrome"),
            FunctionLookup::TitleHeuristic("isPalindrome".into())
        );
    }

    #[test]
    fn falls_back_to_camel_cased_title() {
        let src = "window.countVowels = s => (s.match(/[aeiou]/g) || []).length; countVowels;";
        assert_eq!(
            find_function_name(src, "Count Vowels"),
            FunctionLookup::TitleHeuristic("countVowels".into())
        );
    }

    #[test]
    fn reports_not_found() {
        assert_eq!(find_function_name("1 + 1", "Two Sum"), FunctionLookup::NotFound);
        assert_eq!(FunctionLookup::NotFound.name(), None);
    }

    #[test]
    fn camel_case_handles_punctuation() {
        assert_eq!(camel_case("Reverse a String!").as_deref(), Some("reverseAString"));
        assert_eq!(camel_case("  "), None);
        assert_eq!(camel_case("3Sum"), None);
    }
}
