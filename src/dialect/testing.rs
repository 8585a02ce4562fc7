//! Pipe-operator transpiler used as a stand-in dialect in tests
//!
//! Rewrites `a |> f |> g` into `g(f(a))` line by line. A leading `return`
//! or simple declaration is kept in front of the rewritten expression.
//! Every load bumps `globalThis.pipeLoads`.

use super::Transpiler;

pub(crate) const PIPE_BUNDLE: &str = r#"globalThis.pipeLoads = (globalThis.pipeLoads ?? 0) + 1;
function compile(src, opts) {
  if (!opts || opts.js !== true) throw new Error('expected {js:true}');
  return src.split('\n').map((line) => {
    if (!line.includes('|>')) return line;
    const head = /^(\s*(?:return\s+|(?:const|let|var)\s+[\w$]+\s*=\s*)?)/.exec(line)[1];
    let body = line.slice(head.length);
    let tail = '';
    if (body.trimEnd().endsWith(';')) {
      body = body.trimEnd().slice(0, -1);
      tail = ';';
    }
    const stages = body.split('|>').map((s) => s.trim());
    if (stages.some((s) => s === '')) throw new SyntaxError('empty pipe stage');
    const expr = stages.slice(1).reduce((acc, fn) => `${fn}(${acc})`, stages[0]);
    return head + expr + tail;
  }).join('\n');
}
"#;

pub(crate) fn pipe_transpiler() -> Transpiler {
    Transpiler::new("pipe", PIPE_BUNDLE)
}
