use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;

static SCRIPT_CLOSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</(script)").unwrap());

/// Runs inside the snippet's context; installs the console shim and returns the capture function
///
/// Everything the snippet can reach is created in its own context, and the
/// reply handed back out is a JSON string, never an object.
const CAPTURE: &str = r#"(() => {
  const logs = [];
  const stringify = JSON.stringify;
  const toText = String;
  globalThis.console = Object.freeze({
    log: (...args) => {
      logs.push(args.map((arg) => toText(arg)).join(" "));
    },
  });
  return (snippet) => {
    let error = null;
    try {
      const result = snippet();
      if (result !== undefined) {
        logs.push(toText(result));
      }
    } catch (err) {
      error = toText(err);
    }
    return stringify({ output: logs.join("\n"), error });
  };
})()"#;

/// Encodes `source` as a script string literal that cannot end the embedding early
///
/// Besides regular string escaping, closing script tags are broken up and the
/// line/paragraph separators older engines treat as line terminators are escaped.
pub fn escape_source(source: &str) -> Result<String> {
    let literal = serde_json::to_string(source)?;
    let literal = SCRIPT_CLOSE_RE.replace_all(&literal, r"<\/$1");
    Ok(literal
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029"))
}

/// Builds the host script that runs `source` in a fresh context and reports back tagged with `nonce`
///
/// The context has no host globals and refuses string code generation and
/// dynamic `import()`.
pub fn build(source: &str, nonce: &str) -> Result<String> {
    let source = escape_source(source)?;
    let nonce = serde_json::to_string(nonce)?;
    let capture = serde_json::to_string(CAPTURE)?;

    Ok(format!(
        r#"(function () {{
  const vm = require("node:vm");
  const channel = process.stdout;
  const nonce = {nonce};
  const source = {source};
  const refuseImport = () => {{
    throw "import() is not available in the sandbox";
  }};
  let reply;
  try {{
    const context = vm.createContext(Object.create(null), {{
      codeGeneration: {{ strings: false, wasm: false }},
    }});
    const capture = new vm.Script({capture}, {{ filename: "capture.js" }}).runInContext(context);
    let snippet;
    try {{
      snippet = new vm.Script("(function () {{\n" + source + "\n}})", {{
        filename: "snippet.js",
        importModuleDynamically: refuseImport,
      }}).runInContext(context);
    }} catch (err) {{
      reply = JSON.stringify({{ output: "", error: String(err) }});
    }}
    if (snippet !== undefined) {{
      reply = capture(snippet);
    }}
  }} catch (err) {{
    reply = JSON.stringify({{ output: "", error: "Sandbox failure: " + String(err) }});
  }}
  if (typeof reply !== "string") {{
    reply = JSON.stringify({{ output: "", error: "Sandbox failure: malformed reply" }});
  }}
  channel.write(nonce + " " + reply + "\n");
}})();
"#
    ))
}
