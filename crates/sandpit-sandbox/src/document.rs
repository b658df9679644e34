//! Host document builder.
//!
//! One parameterised builder produces every document variant. What gets
//! injected is decided by [`Capabilities`]; which runtime libraries and
//! discovery code are added is decided by the bundle's [`ExecutionMode`].
//!
//! The result is a structured [`HostDocument`]. Browser hosts use
//! [`HostDocument::render`] or [`HostDocument::to_iframe`]; the headless
//! context manager walks [`HostDocument::scripts`] directly.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::bundle::{ExecutionMode, SourceBundle};
use crate::error::SandboxError;
use crate::escape::{escape_html_attribute, escape_js_string, guard_closing_tag, js_string_literal};
use crate::shims;
use crate::transform::{transform_detailed, Lookup};
use crate::validator::{validate_source, DEFAULT_MAX_CODE_SIZE};

/// Pinned component framework build.
pub const REACT_URL: &str = "https://unpkg.com/react@18.2.0/umd/react.development.js";
/// Pinned DOM renderer build.
pub const REACT_DOM_URL: &str = "https://unpkg.com/react-dom@18.2.0/umd/react-dom.development.js";
/// Pinned in-page JSX transpiler.
pub const BABEL_URL: &str = "https://unpkg.com/@babel/standalone@7.23.5/babel.min.js";

/// Components probed after any default export, in this order.
const DISCOVERY_CANDIDATES: &[&str] = &["Counter", "Component", "App"];

const ROOT_ID: &str = "root";

static ELEMENT_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\sid\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap()
});

/// How the document reaches its frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadMethod {
    /// The host writes the rendered text into the frame's document.
    ///
    /// Requires `allow-same-origin` so the host can open the frame document.
    #[default]
    DocumentWrite,
    /// The rendered text is supplied through the `srcdoc` attribute.
    Srcdoc,
}

/// What a document is allowed to do, requested explicitly per build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Inject the console shim and the global error shim.
    pub console_capture: bool,
    /// Inject `window.runTest` and the test-support template.
    pub test_harness: bool,
    /// Expose the frozen `window.proctoring` reporting object.
    pub proctoring: bool,
    /// Load method for the frame.
    pub load: LoadMethod,
}

impl Capabilities {
    /// Live preview of a vanilla or logic bundle.
    pub fn live_preview() -> Self {
        Self {
            console_capture: true,
            load: LoadMethod::DocumentWrite,
            ..Default::default()
        }
    }

    /// Live preview of a component bundle.
    pub fn react_preview() -> Self {
        Self {
            console_capture: true,
            load: LoadMethod::Srcdoc,
            ..Default::default()
        }
    }

    /// A document that runs a single test case.
    pub fn test_harness() -> Self {
        Self {
            console_capture: true,
            test_harness: true,
            load: LoadMethod::Srcdoc,
            ..Default::default()
        }
    }

    /// Adds the proctoring capability.
    pub fn with_proctoring(mut self) -> Self {
        self.proctoring = true;
        self
    }
}

/// Frame sandbox flags. `allow-scripts` is always granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxFlags {
    allow_same_origin: bool,
}

impl SandboxFlags {
    /// The least-privilege flags for `caps`.
    pub fn required_for(caps: &Capabilities) -> Self {
        Self {
            allow_same_origin: caps.load == LoadMethod::DocumentWrite || caps.test_harness,
        }
    }

    /// Whether the frame shares the host origin.
    pub fn allows_same_origin(&self) -> bool {
        self.allow_same_origin
    }

    /// Value of the frame's `sandbox` attribute.
    pub fn as_attribute(&self) -> &'static str {
        if self.allow_same_origin {
            "allow-scripts allow-same-origin"
        } else {
            "allow-scripts"
        }
    }
}

impl fmt::Display for SandboxFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_attribute())
    }
}

/// Target origin the document uses when posting relay messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TargetOrigin {
    /// The document's own origin (`window.location.origin`).
    #[default]
    Document,
    /// `*`: delivered to whatever origin the parent has.
    Wildcard,
    /// A fixed origin such as `https://app.example.com`.
    Exact(String),
}

impl TargetOrigin {
    /// Parses the configuration spelling: `document`, `*` or an origin.
    pub fn parse(value: &str) -> Self {
        match value {
            "document" => Self::Document,
            "*" => Self::Wildcard,
            origin => Self::Exact(origin.to_string()),
        }
    }

    /// JS expression evaluating to the target origin string.
    pub fn js_expression(&self) -> String {
        match self {
            Self::Document => "window.location.origin".to_string(),
            Self::Wildcard => "'*'".to_string(),
            Self::Exact(origin) => js_string_literal(origin),
        }
    }
}

/// Runtime library locations for component bundles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLibraries {
    /// Component framework.
    pub react_url: String,
    /// DOM renderer.
    pub react_dom_url: String,
    /// JSX transpiler.
    pub babel_url: String,
}

impl Default for RuntimeLibraries {
    fn default() -> Self {
        Self {
            react_url: REACT_URL.to_string(),
            react_dom_url: REACT_DOM_URL.to_string(),
            babel_url: BABEL_URL.to_string(),
        }
    }
}

/// Builder settings shared by every document a host produces.
#[derive(Debug, Clone)]
pub struct DocumentOptions {
    /// Runtime libraries injected in component mode.
    pub runtime: RuntimeLibraries,
    /// Relay target origin requested by the host.
    pub target_origin: TargetOrigin,
    /// Maximum size of each bundle part in bytes.
    pub max_part_size: usize,
}

impl Default for DocumentOptions {
    fn default() -> Self {
        Self {
            runtime: RuntimeLibraries::default(),
            target_origin: TargetOrigin::default(),
            max_part_size: DEFAULT_MAX_CODE_SIZE,
        }
    }
}

/// How an inline block is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    /// Executed as written.
    Classic,
    /// JSX, transpiled in-page before execution.
    Jsx,
}

/// One `<script>` element of a host document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptBlock {
    /// A library loaded from a URL.
    External {
        /// Source URL.
        url: String,
    },
    /// Inline source.
    Inline {
        /// Short name used in error locations, e.g. `user` or `harness`.
        label: &'static str,
        /// Execution kind.
        kind: ScriptKind,
        /// Script text.
        source: String,
    },
}

impl ScriptBlock {
    fn classic(label: &'static str, source: String) -> Self {
        Self::Inline {
            label,
            kind: ScriptKind::Classic,
            source,
        }
    }

    fn jsx(label: &'static str, source: String) -> Self {
        Self::Inline {
            label,
            kind: ScriptKind::Jsx,
            source,
        }
    }

    /// Label of an inline block, `None` for external ones.
    pub fn label(&self) -> Option<&'static str> {
        match self {
            Self::Inline { label, .. } => Some(label),
            Self::External { .. } => None,
        }
    }

    fn render(&self, out: &mut String) {
        match self {
            Self::External { url } => {
                out.push_str("<script src=\"");
                out.push_str(&escape_html_attribute(url));
                out.push_str("\" crossorigin></script>\n");
            }
            Self::Inline { label, kind, source } => {
                match kind {
                    ScriptKind::Classic => out.push_str("<script"),
                    ScriptKind::Jsx => out.push_str("<script type=\"text/babel\" data-presets=\"react\""),
                }
                out.push_str(" data-sandpit=\"");
                out.push_str(label);
                out.push_str("\">\n");
                out.push_str(&guard_closing_tag(source, "script"));
                out.push_str("\n</script>\n");
            }
        }
    }
}

/// A complete, self-contained document ready to load into an isolated context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDocument {
    mode: ExecutionMode,
    styles: String,
    markup: String,
    scripts: Vec<ScriptBlock>,
    flags: SandboxFlags,
    load: LoadMethod,
    relay_target: TargetOrigin,
    element_ids: Vec<String>,
}

impl HostDocument {
    /// Execution mode of the bundle the document was built from.
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Scripts in execution order.
    pub fn scripts(&self) -> &[ScriptBlock] {
        &self.scripts
    }

    /// Frame sandbox flags.
    pub fn sandbox_flags(&self) -> SandboxFlags {
        self.flags
    }

    /// Load method for the frame.
    pub fn load_method(&self) -> LoadMethod {
        self.load
    }

    /// Target origin used by every injected relay call.
    pub fn relay_target(&self) -> &TargetOrigin {
        &self.relay_target
    }

    /// Element ids present in the body, including an injected `root`.
    pub fn element_ids(&self) -> &[String] {
        &self.element_ids
    }

    /// Body markup as it is rendered.
    pub fn markup(&self) -> &str {
        &self.markup
    }

    /// The full HTML text of the document.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(
            self.markup.len() + self.styles.len() + 4096 + self.scripts.len() * 512,
        );
        out.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n");
        out.push_str("<meta charset=\"utf-8\">\n");
        out.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n");
        out.push_str("<style>\n");
        out.push_str(shims::BASE_STYLES);
        out.push_str("\n</style>\n");
        if !self.styles.is_empty() {
            out.push_str("<style>\n");
            out.push_str(&guard_closing_tag(&self.styles, "style"));
            out.push_str("\n</style>\n");
        }
        out.push_str("</head>\n<body>\n");
        out.push_str(&self.markup);
        out.push('\n');
        for script in &self.scripts {
            script.render(&mut out);
        }
        out.push_str("</body>\n</html>\n");
        out
    }

    /// Frame markup embedding this document.
    ///
    /// With [`LoadMethod::DocumentWrite`] the frame is empty and the host
    /// writes [`render`](Self::render) into it after insertion.
    pub fn to_iframe(&self, title: &str) -> String {
        let title = escape_html_attribute(title);
        let flags = self.flags.as_attribute();
        match self.load {
            LoadMethod::Srcdoc => format!(
                "<iframe title=\"{title}\" sandbox=\"{flags}\" srcdoc=\"{}\"></iframe>",
                escape_html_attribute(&self.render())
            ),
            LoadMethod::DocumentWrite => {
                format!("<iframe title=\"{title}\" sandbox=\"{flags}\"></iframe>")
            }
        }
    }
}

/// Assembles [`HostDocument`]s from source bundles.
#[derive(Debug, Clone, Default)]
pub struct DocumentBuilder {
    options: DocumentOptions,
}

impl DocumentBuilder {
    /// Create a builder with the given options.
    pub fn new(options: DocumentOptions) -> Self {
        Self { options }
    }

    /// Builder options.
    pub fn options(&self) -> &DocumentOptions {
        &self.options
    }

    /// Builds the document for `bundle` with exactly the requested capabilities.
    pub fn build(
        &self,
        bundle: &SourceBundle,
        caps: Capabilities,
    ) -> Result<HostDocument, SandboxError> {
        let max = Some(self.options.max_part_size);
        validate_source("script", &bundle.script, max)?;
        validate_source("markup", &bundle.markup, max)?;
        validate_source("styles", &bundle.styles, max)?;
        if let Some(support) = &bundle.test_support {
            validate_source("test support", support, max)?;
        }

        if caps.test_harness && bundle.mode == ExecutionMode::PureLogic {
            return Err(SandboxError::DocumentBuild {
                reason: "the test harness cannot reach functions defined in pure-logic mode"
                    .into(),
            });
        }

        let flags = SandboxFlags::required_for(&caps);
        let relay_target = self.resolve_target(flags);
        let target = relay_target.js_expression();

        let transformed = transform_detailed(&bundle.script, bundle.mode);

        let mut element_ids = collect_element_ids(&bundle.markup);
        let mut markup = bundle.markup.clone();
        if bundle.mode == ExecutionMode::ReactComponent && !element_ids.iter().any(|id| id == ROOT_ID) {
            if !markup.is_empty() && !markup.ends_with('\n') {
                markup.push('\n');
            }
            markup.push_str("<div id=\"root\"></div>");
            element_ids.push(ROOT_ID.to_string());
        }

        let mut scripts = Vec::new();
        if caps.console_capture {
            scripts.push(ScriptBlock::classic("console", shims::console_shim(&target)));
            scripts.push(ScriptBlock::classic("errors", shims::error_shim(&target)));
        }
        if caps.proctoring {
            scripts.push(ScriptBlock::classic("proctoring", shims::proctoring_shim(&target)));
        }
        if bundle.mode == ExecutionMode::ReactComponent {
            let runtime = &self.options.runtime;
            for url in [&runtime.react_url, &runtime.react_dom_url, &runtime.babel_url] {
                scripts.push(ScriptBlock::External { url: url.clone() });
            }
        }

        let user = match bundle.mode {
            ExecutionMode::VanillaDom => ScriptBlock::classic("user", transformed.source),
            ExecutionMode::ReactComponent => ScriptBlock::jsx("user", transformed.source),
            ExecutionMode::PureLogic => ScriptBlock::classic(
                "user",
                shims::pure_logic_runner(&escape_js_string(&transformed.source)),
            ),
        };
        scripts.push(user);

        if caps.test_harness {
            if let Some(support) = &bundle.test_support {
                let block = match bundle.mode {
                    ExecutionMode::ReactComponent => ScriptBlock::jsx("test-support", support.clone()),
                    _ => ScriptBlock::classic("test-support", support.clone()),
                };
                scripts.push(block);
            }
            scripts.push(ScriptBlock::classic("harness", shims::test_harness(&target)));
        }

        if bundle.mode == ExecutionMode::ReactComponent {
            let candidates = discovery_candidates(&transformed.default_export);
            scripts.push(ScriptBlock::jsx(
                "discovery",
                shims::component_discovery(&candidates),
            ));
        }

        scripts.push(ScriptBlock::classic("ready", shims::ready_beacon(&target)));

        tracing::debug!(
            mode = %bundle.mode,
            scripts = scripts.len(),
            sandbox = flags.as_attribute(),
            "host document built"
        );

        Ok(HostDocument {
            mode: bundle.mode,
            styles: bundle.styles.clone(),
            markup,
            scripts,
            flags,
            load: caps.load,
            relay_target,
            element_ids,
        })
    }

    fn resolve_target(&self, flags: SandboxFlags) -> TargetOrigin {
        match &self.options.target_origin {
            TargetOrigin::Document if !flags.allows_same_origin() => {
                // An opaque origin serialises as "null", which never matches the host.
                tracing::debug!(
                    sandbox = flags.as_attribute(),
                    "opaque-origin document, relay target falls back to '*'"
                );
                TargetOrigin::Wildcard
            }
            other => other.clone(),
        }
    }
}

fn discovery_candidates(default_export: &Lookup) -> Vec<String> {
    let mut candidates = Vec::with_capacity(DISCOVERY_CANDIDATES.len() + 1);
    if let Some(name) = default_export.identifier() {
        candidates.push(name.to_string());
    }
    for name in DISCOVERY_CANDIDATES {
        if !candidates.iter().any(|c| c == name) {
            candidates.push((*name).to_string());
        }
    }
    candidates
}

fn collect_element_ids(markup: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for caps in ELEMENT_ID_RE.captures_iter(markup) {
        if let Some(id) = caps.get(1).or_else(|| caps.get(2)) {
            let id = id.as_str().trim();
            if !id.is_empty() && !ids.iter().any(|known| known == id) {
                ids.push(id.to_string());
            }
        }
    }
    ids
}
