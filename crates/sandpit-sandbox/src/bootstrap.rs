//! Scripts the host runs inside a context: the headless window environment
//! and the small drivers that call into it.
//!
//! Everything reaches the environment through the host hook stored under
//! `Symbol.for('sandpit.host')`. The hook is non-enumerable and frozen.

use crate::escape::js_string_literal;

const WINDOW_BOOTSTRAP: &str = r#"((core) => {
  const ops = core.ops;
  const g = globalThis;
  const ORIGIN = __ORIGIN__;
  const ELEMENT_IDS = __ELEMENT_IDS__;

  const describe = (value) => {
    if (typeof value === 'string') return value;
    if (value instanceof Error) return value.name + ': ' + value.message;
    try {
      const json = JSON.stringify(value);
      return json === undefined ? String(value) : json;
    } catch (_) {
      return String(value);
    }
  };
  const baseLog = (level) => (...args) => ops.op_sandpit_log(level, args.map(describe).join(' '));
  const baseConsole = {
    log: baseLog('log'),
    info: baseLog('info'),
    debug: baseLog('debug'),
    warn: baseLog('warn'),
    error: baseLog('error'),
  };

  const makeEvent = (type, init) => {
    let prevented = false;
    return Object.assign({
      type,
      preventDefault() { prevented = true; },
      get defaultPrevented() { return prevented; },
    }, init || {});
  };

  const createEventTarget = (owner) => {
    const listeners = new Map();
    return {
      addEventListener(type, listener) {
        if (typeof listener !== 'function' && !(listener && typeof listener.handleEvent === 'function')) return;
        const list = listeners.get(type) || [];
        if (!list.includes(listener)) list.push(listener);
        listeners.set(type, list);
      },
      removeEventListener(type, listener) {
        const list = listeners.get(type);
        if (!list) return;
        const index = list.indexOf(listener);
        if (index >= 0) list.splice(index, 1);
      },
      dispatchEvent(event) {
        for (const listener of (listeners.get(event.type) || []).slice()) {
          try {
            if (typeof listener === 'function') listener.call(owner(), event);
            else listener.handleEvent(event);
          } catch (error) {
            if (event.type === 'error') baseConsole.error(describe(error));
            else reportError('Uncaught ' + describe(error));
          }
        }
        return !event.defaultPrevented;
      },
    };
  };

  const windowEvents = createEventTarget(() => g);

  const reportError = (message) => {
    const text = String(message);
    let handled = false;
    if (typeof g.onerror === 'function') {
      try { handled = g.onerror(text, '', 0, 0, undefined) === true; } catch (_) {}
    } else {
      baseConsole.error(text);
    }
    windowEvents.dispatchEvent(makeEvent('error', { message: text, error: undefined }));
    return handled;
  };

  const makeElement = (tagName, id) => {
    const events = createEventTarget(() => element);
    const element = {
      nodeType: 1,
      tagName: String(tagName).toUpperCase(),
      id: id || '',
      className: '',
      innerHTML: '',
      textContent: '',
      value: '',
      style: {},
      dataset: {},
      children: [],
      attributes: {},
      appendChild(child) { this.children.push(child); return child; },
      removeChild(child) {
        const index = this.children.indexOf(child);
        if (index >= 0) this.children.splice(index, 1);
        return child;
      },
      setAttribute(name, value) { this.attributes[name] = String(value); },
      getAttribute(name) {
        return Object.prototype.hasOwnProperty.call(this.attributes, name) ? this.attributes[name] : null;
      },
      addEventListener: events.addEventListener,
      removeEventListener: events.removeEventListener,
      dispatchEvent: events.dispatchEvent,
      click() { events.dispatchEvent(makeEvent('click', { target: element })); },
    };
    return element;
  };

  const known = new Set(ELEMENT_IDS);
  const elements = new Map();
  const documentEvents = createEventTarget(() => documentStub);
  const documentStub = {
    nodeType: 9,
    readyState: 'loading',
    hidden: false,
    visibilityState: 'visible',
    body: makeElement('body'),
    head: makeElement('head'),
    getElementById(id) {
      if (!known.has(id)) return null;
      if (!elements.has(id)) elements.set(id, makeElement('div', id));
      return elements.get(id);
    },
    querySelector(selector) {
      return typeof selector === 'string' && selector.startsWith('#')
        ? this.getElementById(selector.slice(1))
        : null;
    },
    createElement(tagName) { return makeElement(tagName); },
    createTextNode(text) { return { nodeType: 3, textContent: String(text) }; },
    addEventListener: documentEvents.addEventListener,
    removeEventListener: documentEvents.removeEventListener,
    dispatchEvent: documentEvents.dispatchEvent,
  };

  const timers = new Set();
  let nextTimerId = 1;
  const clampDelay = (ms) => {
    const n = Number(ms);
    return n > 0 ? Math.min(Math.floor(n), 2147483647) : 0;
  };
  const fire = (callback, args) => {
    try {
      if (typeof callback === 'function') callback(...args);
    } catch (error) {
      reportError('Uncaught ' + describe(error));
    }
  };
  const setTimeout = (callback, ms, ...args) => {
    const id = nextTimerId++;
    timers.add(id);
    ops.op_sandpit_sleep(clampDelay(ms)).then(() => {
      if (timers.delete(id)) fire(callback, args);
    });
    return id;
  };
  const setInterval = (callback, ms, ...args) => {
    const id = nextTimerId++;
    const delay = clampDelay(ms);
    timers.add(id);
    const tick = () => ops.op_sandpit_sleep(delay).then(() => {
      if (!timers.has(id)) return;
      fire(callback, args);
      tick();
    });
    tick();
    return id;
  };
  const clearTimer = (id) => { timers.delete(id); };

  if (typeof core.setUnhandledPromiseRejectionHandler === 'function') {
    core.setUnhandledPromiseRejectionHandler((promise, reason) => {
      const event = makeEvent('unhandledrejection', { promise, reason });
      windowEvents.dispatchEvent(event);
      if (!event.defaultPrevented) baseConsole.error('Unhandled promise rejection: ' + describe(reason));
      return true;
    });
  }

  const parent = Object.freeze({
    postMessage(message, targetOrigin) {
      if (arguments.length < 2) {
        throw new TypeError("Failed to execute 'postMessage': 2 arguments required.");
      }
      const data = JSON.stringify(message);
      if (data === undefined) return;
      ops.op_sandpit_post_message(data, String(targetOrigin));
    },
  });
  const location = Object.freeze({
    origin: ORIGIN,
    href: ORIGIN === 'null' ? 'about:srcdoc' : 'about:blank',
  });

  const define = (name, value) => Object.defineProperty(g, name, {
    value, writable: true, configurable: true, enumerable: false,
  });
  define('window', g);
  define('self', g);
  define('parent', parent);
  define('top', parent);
  define('location', location);
  define('document', documentStub);
  define('console', baseConsole);
  define('addEventListener', windowEvents.addEventListener);
  define('removeEventListener', windowEvents.removeEventListener);
  define('dispatchEvent', windowEvents.dispatchEvent);
  define('setTimeout', setTimeout);
  define('clearTimeout', clearTimer);
  define('setInterval', setInterval);
  define('clearInterval', clearTimer);
  g.onerror = null;
  g.onload = null;

  const fireLoad = () => {
    documentStub.readyState = 'complete';
    documentEvents.dispatchEvent(makeEvent('DOMContentLoaded'));
    const event = makeEvent('load');
    if (typeof g.onload === 'function') {
      try { g.onload(event); } catch (error) { reportError('Uncaught ' + describe(error)); }
    }
    windowEvents.dispatchEvent(event);
  };

  const invokeTest = (json) => {
    if (typeof g.runTest !== 'function') {
      ops.op_sandpit_post_message(JSON.stringify({
        type: 'test-result',
        success: false,
        error: 'runTest is not available in this document',
      }), '*');
      return;
    }
    g.runTest(JSON.parse(json));
  };

  Object.defineProperty(g, Symbol.for('sandpit.host'), {
    value: Object.freeze({
      reportError,
      fireLoad,
      invokeTest,
      setResult: (json) => ops.op_sandpit_set_result(String(json)),
    }),
    enumerable: false,
    configurable: false,
    writable: false,
  });

  delete g.Deno;
  delete g.__bootstrap;
})(Deno.core);"#;

const HOST: &str = "globalThis[Symbol.for('sandpit.host')]";

/// The headless window environment.
///
/// `origin` is the serialised origin reported by `location.origin`
/// (`"null"` for an opaque origin); `element_ids` are the ids
/// `document.getElementById` resolves.
pub(crate) fn window_bootstrap(origin: &str, element_ids: &[String]) -> String {
    let ids = element_ids
        .iter()
        .map(|id| js_string_literal(id))
        .collect::<Vec<_>>()
        .join(", ");
    WINDOW_BOOTSTRAP
        .replace("__ORIGIN__", &js_string_literal(origin))
        .replace("__ELEMENT_IDS__", &format!("[{ids}]"))
}

/// Routes a load-time error through `window.onerror` and the `error` event.
pub(crate) fn report_error(message: &str) -> String {
    format!("{HOST}.reportError({});", js_string_literal(message))
}

/// Marks the document complete and dispatches `load`.
pub(crate) fn fire_load() -> String {
    format!("{HOST}.fireLoad();")
}

/// Calls `window.runTest` with `input_json` parsed in the context.
pub(crate) fn invoke_test(input_json: &str) -> String {
    format!("{HOST}.invokeTest({});", js_string_literal(input_json))
}

/// Transpiles JSX with the document's own Babel build.
///
/// Stores `{"code": ...}` or `{"error": ...}` as the script result.
pub(crate) fn transpile_jsx(source: &str) -> String {
    format!(
        r#"(() => {{
  const host = {HOST};
  try {{
    if (typeof Babel === 'undefined' || typeof Babel.transform !== 'function') {{
      host.setResult(JSON.stringify({{ error: 'JSX transpiler is not loaded' }}));
      return;
    }}
    host.setResult(JSON.stringify({{ code: Babel.transform({src}, {{ presets: ['react'] }}).code }}));
  }} catch (e) {{
    host.setResult(JSON.stringify({{ error: String(e && e.message ? e.message : e) }}));
  }}
}})();"#,
        src = js_string_literal(source)
    )
}

/// Calls `function` with arguments derived from `input_json` and stores the
/// outcome envelope: `{"ok": value}`, `{"undefined": true}` or `{"error": msg}`.
///
/// `function` must be an identifier; it is probed with `typeof` so a missing
/// binding becomes an error envelope instead of a `ReferenceError`.
pub(crate) fn call_function(function: &str, input_json: &str) -> String {
    format!(
        r#"(async () => {{
  const host = {HOST};
  try {{
    const input = JSON.parse({input});
    const args = input !== null && typeof input === 'object' && !Array.isArray(input)
      ? Object.values(input)
      : [input];
    if (typeof {function} !== 'function') {{
      throw new Error({missing});
    }}
    const result = await {function}(...args);
    host.setResult(JSON.stringify(result === undefined ? {{ undefined: true }} : {{ ok: result }}));
  }} catch (e) {{
    host.setResult(JSON.stringify({{ error: e && e.message ? e.message : String(e) }}));
  }}
}})();"#,
        input = js_string_literal(input_json),
        missing = js_string_literal(&format!("{function} is not a function")),
    )
}
