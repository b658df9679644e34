//! JavaScript injected into host documents.
//!
//! Every shim is an IIFE written against plain browser globals (`window`,
//! `document`, `window.parent.postMessage`), so the same text runs in a real
//! frame and in the headless window environment. `TARGET` is substituted with
//! the JS expression naming the relay target origin.

const TARGET: &str = "__TARGET__";

const CONSOLE_SHIM: &str = r#"(function () {
  var target = __TARGET__;
  var original = window.console || {};
  var serialize = function (value) {
    if (value === null) return 'null';
    if (value === undefined) return 'undefined';
    if (value instanceof Error) return value.name + ': ' + value.message;
    if (typeof value === 'object') {
      try { return JSON.stringify(value); } catch (_) { return String(value); }
    }
    return String(value);
  };
  var relay = function (level, args) {
    try {
      window.parent.postMessage({
        type: 'console',
        level: level,
        message: Array.prototype.map.call(args, serialize).join(' '),
        timestamp: Date.now()
      }, target);
    } catch (_) {}
  };
  var wrap = function (level) {
    var through = typeof original[level] === 'function' ? original[level] : null;
    return function () {
      if (through) {
        try { through.apply(original, arguments); } catch (_) {}
      }
      relay(level, arguments);
    };
  };
  var shimmed = Object.create(original);
  shimmed.log = wrap('log');
  shimmed.warn = wrap('warn');
  shimmed.error = wrap('error');
  window.console = shimmed;
})();"#;

const ERROR_SHIM: &str = r#"(function () {
  var target = __TARGET__;
  var post = function (message) {
    try {
      window.parent.postMessage({
        type: 'console',
        level: 'error',
        message: message,
        timestamp: Date.now()
      }, target);
    } catch (_) {}
  };
  window.onerror = function (message, source, line, column, error) {
    var text = error && error.stack ? String(error.stack) : String(message);
    if (!error && line) {
      text += ' (line ' + line + (column ? ':' + column : '') + ')';
    }
    post(text);
    return false;
  };
  window.addEventListener('unhandledrejection', function (event) {
    var reason = event.reason;
    var text = reason && reason.message ? reason.message : String(reason);
    post('Unhandled promise rejection: ' + text);
    event.preventDefault();
  });
})();"#;

const PROCTORING_SHIM: &str = r#"(function () {
  var target = __TARGET__;
  var violations = [];
  var proctoring = Object.freeze({
    report: function (type, severity, description) {
      var violation = {
        type: String(type),
        severity: String(severity || 'medium'),
        description: String(description || ''),
        timestamp: Date.now()
      };
      violations.push(violation);
      try {
        window.parent.postMessage({ type: 'violation', violation: violation }, target);
      } catch (_) {}
    },
    snapshot: function () { return violations.slice(); }
  });
  Object.defineProperty(window, 'proctoring', {
    value: proctoring, enumerable: false, configurable: false, writable: false
  });
  if (document && typeof document.addEventListener === 'function') {
    document.addEventListener('visibilitychange', function () {
      if (document.hidden) {
        proctoring.report('tab-switch', 'medium', 'Document hidden during the attempt');
      }
    });
  }
})();"#;

const PURE_LOGIC_RUNNER: &str = r#"(function () {
  var source = "__SOURCE__";
  try {
    (new Function(source))();
  } catch (error) {
    console.error(error && error.message ? error.name + ': ' + error.message : String(error));
  }
})();"#;

const TEST_HARNESS: &str = r#"(function () {
  var target = __TARGET__;
  var post = function (payload) {
    payload.type = 'test-result';
    try { window.parent.postMessage(payload, target); } catch (_) {}
  };
  var describe = function (error) {
    return error && error.message ? error.message : String(error);
  };
  var runTest = function (input) {
    var outcome;
    try {
      if (typeof executeTest !== 'function') {
        throw new Error('executeTest is not defined');
      }
      outcome = executeTest(input);
    } catch (error) {
      post({ success: false, error: describe(error) });
      return;
    }
    Promise.resolve(outcome).then(function (result) {
      post({ success: true, result: result === undefined ? null : result, defined: result !== undefined });
    }, function (error) {
      post({ success: false, error: describe(error) });
    });
  };
  Object.defineProperty(window, 'runTest', {
    value: runTest, enumerable: false, configurable: false, writable: false
  });
})();"#;

const READY_BEACON: &str = r#"(function () {
  var target = __TARGET__;
  var announce = function () {
    try { window.parent.postMessage({ type: 'ready' }, target); } catch (_) {}
  };
  if (document.readyState === 'complete') {
    announce();
  } else {
    window.addEventListener('load', announce);
  }
})();"#;

/// Styles every document starts from.
pub(crate) const BASE_STYLES: &str = "body { margin: 0; font-family: system-ui, sans-serif; }\n\
.sandpit-error { color: #b00020; font-family: monospace; padding: 8px; white-space: pre-wrap; }";

pub(crate) fn console_shim(target: &str) -> String {
    CONSOLE_SHIM.replace(TARGET, target)
}

pub(crate) fn error_shim(target: &str) -> String {
    ERROR_SHIM.replace(TARGET, target)
}

pub(crate) fn proctoring_shim(target: &str) -> String {
    PROCTORING_SHIM.replace(TARGET, target)
}

pub(crate) fn test_harness(target: &str) -> String {
    TEST_HARNESS.replace(TARGET, target)
}

pub(crate) fn ready_beacon(target: &str) -> String {
    READY_BEACON.replace(TARGET, target)
}

/// `escaped_source` must already be escaped for a double-quoted literal.
pub(crate) fn pure_logic_runner(escaped_source: &str) -> String {
    PURE_LOGIC_RUNNER.replace("__SOURCE__", escaped_source)
}

/// Mounts the first defined candidate component into `#root`.
///
/// Candidates are probed with `typeof`, which also sees top-level `const`
/// and `class` bindings that never become `window` properties.
pub(crate) fn component_discovery(candidates: &[String]) -> String {
    let probe = candidates
        .iter()
        .map(|name| format!("typeof {name} !== 'undefined' ? {name} : "))
        .collect::<String>();
    let listed = candidates.join(", ");
    format!(
        r#"(function () {{
  var mount = document.getElementById('root');
  var found = {probe}null;
  if (!found) {{
    if (mount) {{
      mount.innerHTML = '<div class="sandpit-error">No component found. Define one of: {listed}</div>';
    }}
    return;
  }}
  try {{
    if (typeof ReactDOM.createRoot === 'function') {{
      ReactDOM.createRoot(mount).render(React.createElement(found));
    }} else {{
      ReactDOM.render(React.createElement(found), mount);
    }}
  }} catch (error) {{
    console.error('Render failed: ' + (error && error.message ? error.message : String(error)));
  }}
}})();"#
    )
}
