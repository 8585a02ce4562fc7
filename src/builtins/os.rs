//! The `os` module
//!
//! The working directory is virtual: `chdir` validates the target on the
//! host filesystem and moves the engine's own cwd, never the process cwd.

use std::time::Duration;

use rquickjs::convert::Coerced;
use rquickjs::{Ctx, Function, Object};

use super::Host;
use crate::util::{resolve_path, to_slash};

const ENOENT: i32 = 2;

/// Module source; reads its natives from the install-time host global
pub const SOURCE: &str = r#"export function chdir(path) { return host.chdir(String(path)); }
const host = globalThis.__taskjs_host.os;
export const platform = host.platform;
export function getcwd() { return [host.getcwd(), 0]; }
export function sleep(ms) { host.sleep(Number(ms)); }
export default { platform, chdir, getcwd, sleep };
"#;

/// Platform name in the engine's vocabulary
pub fn platform() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    }
}

pub(crate) fn natives<'js>(ctx: &Ctx<'js>, host: &Host) -> rquickjs::Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;
    obj.set("platform", platform())?;

    let state = host.clone();
    obj.set(
        "chdir",
        Function::new(ctx.clone(), move |path: Coerced<String>| -> i32 {
            let target = resolve_path(&state.borrow().cwd, &path.0);
            match std::fs::metadata(&target) {
                Ok(meta) if meta.is_dir() => {
                    state.borrow_mut().cwd = target;
                    0
                }
                // ENOTDIR
                Ok(_) => -20,
                Err(err) => -err.raw_os_error().unwrap_or(ENOENT),
            }
        })?,
    )?;

    let state = host.clone();
    obj.set(
        "getcwd",
        Function::new(ctx.clone(), move || -> String { to_slash(&state.borrow().cwd) })?,
    )?;

    obj.set(
        "sleep",
        Function::new(ctx.clone(), |ms: f64| {
            if ms.is_finite() && ms > 0.0 {
                std::thread::sleep(Duration::from_secs_f64(ms / 1000.0));
            }
        })?,
    )?;

    Ok(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Engine, EvalFlags};

    fn engine() -> Engine {
        let engine = Engine::create(8 * 1024 * 1024).unwrap();
        engine.prepare().unwrap();
        engine
    }

    fn eval_json(engine: &Engine, source: &str) -> String {
        engine.with(|scope| {
            let val = scope.eval(source, &EvalFlags::default().await_promise()).unwrap();
            let val = scope.check(val).unwrap();
            val.to_json(scope.ctx()).unwrap()
        })
    }

    #[test]
    fn test_chdir_moves_virtual_cwd_only() {
        let dir = tempfile::tempdir().unwrap();
        let host_cwd = std::env::current_dir().unwrap();
        let engine = engine();

        let script = format!(
            "(async()=>{{ const os = await import('os'); return [os.chdir('{}'), os.getcwd()[0]]; }})()",
            crate::util::escape_literal(&to_slash(dir.path()))
        );
        let json = eval_json(&engine, &script);
        assert_eq!(json, format!("[0,\"{}\"]", to_slash(dir.path())));
        assert_eq!(engine.cwd(), dir.path());
        assert_eq!(std::env::current_dir().unwrap(), host_cwd);
    }

    #[test]
    fn test_chdir_relative_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let engine = engine();
        engine.set_cwd(dir.path().to_path_buf());

        let json = eval_json(
            &engine,
            "(async()=>{ const os = await import('os'); return [os.chdir('sub'), os.chdir('missing')]; })()",
        );
        assert_eq!(json, "[0,-2]");
        assert_eq!(engine.cwd(), dir.path().join("sub"));
    }

    #[test]
    fn test_chdir_to_file_is_not_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "x").unwrap();
        let engine = engine();
        engine.set_cwd(dir.path().to_path_buf());

        let json = eval_json(
            &engine,
            "(async()=>(await import('os')).chdir('f.txt'))()",
        );
        assert_eq!(json, "-20");
        assert_eq!(engine.cwd(), dir.path());
    }

    #[test]
    fn test_platform() {
        let engine = engine();
        let json = eval_json(&engine, "(async()=>(await import('os')).platform)()");
        assert_eq!(json, format!("\"{}\"", platform()));
    }
}
