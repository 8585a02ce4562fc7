//! `print` and `console`

use rquickjs::function::Rest;
use rquickjs::{Ctx, Function, Object, Value};

use super::Host;
use crate::value::display_value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Render arguments one per line with a trailing newline
///
/// Returns `None` for an empty argument list.
pub fn render_args<'js>(ctx: &Ctx<'js>, args: &[Value<'js>]) -> rquickjs::Result<Option<String>> {
    if args.is_empty() {
        return Ok(None);
    }
    let mut out = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&display_value(ctx, arg)?);
    }
    out.push('\n');
    Ok(Some(out))
}

fn writer<'js>(ctx: &Ctx<'js>, host: &Host, stream: Stream) -> rquickjs::Result<Function<'js>> {
    let host = host.clone();
    Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<()> {
            if let Some(text) = render_args(&ctx, &args.0)? {
                let mut state = host.borrow_mut();
                match stream {
                    Stream::Stdout => state.stdout.extend_from_slice(text.as_bytes()),
                    Stream::Stderr => state.stderr.extend_from_slice(text.as_bytes()),
                }
            }
            Ok(())
        },
    )
}

pub(crate) fn install<'js>(ctx: &Ctx<'js>, globals: &Object<'js>, host: &Host) -> rquickjs::Result<()> {
    globals.set("print", writer(ctx, host, Stream::Stdout)?)?;

    let console = Object::new(ctx.clone())?;
    console.set("log", writer(ctx, host, Stream::Stdout)?)?;
    console.set("info", writer(ctx, host, Stream::Stdout)?)?;
    console.set("error", writer(ctx, host, Stream::Stderr)?)?;
    console.set("warn", writer(ctx, host, Stream::Stderr)?)?;
    globals.set("console", console)?;
    Ok(())
}
