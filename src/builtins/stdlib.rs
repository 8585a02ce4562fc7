//! The `std` module

use rquickjs::convert::Coerced;
use rquickjs::function::Rest;
use rquickjs::{Ctx, Exception, Function, Object};

use super::Host;
use crate::util::resolve_path;

/// Module source; reads its natives from the install-time host global
pub const SOURCE: &str = r#"export function puts(...args) { host.puts(...args.map(String)); }
const host = globalThis.__taskjs_host.std;
export function getenv(name) { return host.getenv(String(name)); }
export function loadFile(path) { return host.loadFile(String(path)) ?? null; }
export function writeFile(path, data) { host.writeFile(String(path), String(data)); }
export function exists(path) { return host.exists(String(path)); }
export function readStdin() { return host.readStdin(); }
export default { puts, getenv, loadFile, writeFile, exists, readStdin };
"#;

pub(crate) fn natives<'js>(ctx: &Ctx<'js>, host: &Host) -> rquickjs::Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;

    let state = host.clone();
    obj.set(
        "puts",
        Function::new(ctx.clone(), move |args: Rest<Coerced<String>>| {
            let mut state = state.borrow_mut();
            for arg in args.0 {
                state.stdout.extend_from_slice(arg.0.as_bytes());
            }
        })?,
    )?;

    let state = host.clone();
    obj.set(
        "getenv",
        Function::new(ctx.clone(), move |name: Coerced<String>| -> Option<String> {
            state.borrow().env.get(&name.0).cloned()
        })?,
    )?;

    let state = host.clone();
    obj.set(
        "loadFile",
        Function::new(ctx.clone(), move |path: Coerced<String>| -> Option<String> {
            let target = resolve_path(&state.borrow().cwd, &path.0);
            std::fs::read_to_string(target).ok()
        })?,
    )?;

    let state = host.clone();
    obj.set(
        "writeFile",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, path: Coerced<String>, data: Coerced<String>| -> rquickjs::Result<()> {
                let target = resolve_path(&state.borrow().cwd, &path.0);
                std::fs::write(&target, data.0.as_bytes()).map_err(|err| {
                    Exception::throw_internal(&ctx, &format!("{}: {}", target.display(), err))
                })
            },
        )?,
    )?;

    let state = host.clone();
    obj.set(
        "exists",
        Function::new(ctx.clone(), move |path: Coerced<String>| -> bool {
            resolve_path(&state.borrow().cwd, &path.0).exists()
        })?,
    )?;

    let state = host.clone();
    obj.set(
        "readStdin",
        Function::new(ctx.clone(), move || -> String {
            let input = std::mem::take(&mut state.borrow_mut().stdin);
            String::from_utf8_lossy(&input).into_owned()
        })?,
    )?;

    Ok(obj)
}
