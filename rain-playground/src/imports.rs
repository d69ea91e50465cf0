//! Host functions the compiler module imports.
//!
//! | module    | functions                                 |
//! |-----------|-------------------------------------------|
//! | `console` | `log(start, end)`, `error(start, end)`    |
//! | `time`    | `now_perf() -> f64`, `now_unix() -> f64`  |
//! | `math`    | JS `Math` functions over `f64`            |
//! | `env`     | `callback(tag, start, end)`               |

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tracing::{error, info};
use wasmi::{Caller, Extern, Linker, Memory};

use crate::CONSOLE_TARGET;
use crate::dispatch::Callback;
use crate::error::PlaygroundError;
use crate::memory::MemoryRegion;

/// Data stored in the `wasmi` store next to the instance.
pub struct HostState<C> {
    /// Filled in once instantiation finished. Imports must not assume it is
    /// set: a start function can call them before that.
    pub(crate) memory: Option<Memory>,
    pub(crate) memory_export: String,
    pub(crate) started: Instant,
    pub(crate) callback: C,
}

impl<C> HostState<C> {
    pub(crate) fn new(memory_export: String, callback: C) -> Self {
        Self {
            memory: None,
            memory_export,
            started: Instant::now(),
            callback,
        }
    }
}

type HostCaller<'a, C> = Caller<'a, HostState<C>>;

/// Register every import on `linker`.
pub fn define<C: Callback>(linker: &mut Linker<HostState<C>>) -> Result<(), PlaygroundError> {
    define_console(linker)?;
    define_time(linker)?;
    define_math(linker)?;
    define_env(linker)?;
    Ok(())
}

fn define_console<C: Callback>(linker: &mut Linker<HostState<C>>) -> Result<(), PlaygroundError> {
    linker
        .func_wrap(
            "console",
            "log",
            |caller: HostCaller<'_, C>, start: i32, end: i32| -> Result<(), wasmi::Error> {
                let line = read_text(&caller, start, end)?;
                info!(target: CONSOLE_TARGET, "{line}");
                Ok(())
            },
        )
        .map_err(|err| link_error("console", "log", err))?;
    linker
        .func_wrap(
            "console",
            "error",
            |caller: HostCaller<'_, C>, start: i32, end: i32| -> Result<(), wasmi::Error> {
                let line = read_text(&caller, start, end)?;
                error!(target: CONSOLE_TARGET, "{line}");
                Ok(())
            },
        )
        .map_err(|err| link_error("console", "error", err))?;
    Ok(())
}

fn define_time<C: Callback>(linker: &mut Linker<HostState<C>>) -> Result<(), PlaygroundError> {
    linker
        .func_wrap("time", "now_perf", |caller: HostCaller<'_, C>| -> f64 {
            caller.data().started.elapsed().as_secs_f64() * 1000.0
        })
        .map_err(|err| link_error("time", "now_perf", err))?;
    linker
        .func_wrap("time", "now_unix", |_: HostCaller<'_, C>| -> f64 { now_unix() })
        .map_err(|err| link_error("time", "now_unix", err))?;
    Ok(())
}

fn define_math<C: Callback>(linker: &mut Linker<HostState<C>>) -> Result<(), PlaygroundError> {
    for &(name, f) in math::UNARY {
        linker
            .func_wrap("math", name, move |_: HostCaller<'_, C>, x: f64| -> f64 { f(x) })
            .map_err(|err| link_error("math", name, err))?;
    }
    for &(name, f) in math::BINARY {
        linker
            .func_wrap(
                "math",
                name,
                move |_: HostCaller<'_, C>, x: f64, y: f64| -> f64 { f(x, y) },
            )
            .map_err(|err| link_error("math", name, err))?;
    }
    Ok(())
}

fn define_env<C: Callback>(linker: &mut Linker<HostState<C>>) -> Result<(), PlaygroundError> {
    linker
        .func_wrap(
            "env",
            "callback",
            |mut caller: HostCaller<'_, C>,
             tag: i32,
             start: i32,
             end: i32|
             -> Result<(), wasmi::Error> {
                let memory = bound_memory(&caller)?;
                let region = MemoryRegion::new(start, end).map_err(trap)?;
                let (data, state) = memory.data_and_store_mut(&mut caller);
                let payload = region.resolve(data).map_err(trap)?;
                state.callback.on_callback(tag, payload);
                Ok(())
            },
        )
        .map_err(|err| link_error("env", "callback", err))?;
    Ok(())
}

/// The module's memory: the bound one if instantiation already finished,
/// otherwise whatever the calling instance exports under the configured name.
fn bound_memory<C>(caller: &HostCaller<'_, C>) -> Result<Memory, wasmi::Error> {
    let state = caller.data();
    if let Some(memory) = state.memory {
        return Ok(memory);
    }
    caller
        .get_export(&state.memory_export)
        .and_then(Extern::into_memory)
        .ok_or_else(|| wasmi::Error::new("memory export not yet bound"))
}

fn read_text<C>(caller: &HostCaller<'_, C>, start: i32, end: i32) -> Result<String, wasmi::Error> {
    let memory = bound_memory(caller)?;
    let region = MemoryRegion::new(start, end).map_err(trap)?;
    crate::memory::decode(memory.data(caller), region).map_err(trap)
}

fn trap(err: PlaygroundError) -> wasmi::Error {
    wasmi::Error::new(err.to_string())
}

fn link_error(module: &'static str, name: &'static str, err: impl std::fmt::Display) -> PlaygroundError {
    PlaygroundError::Link {
        module,
        name,
        message: err.to_string(),
    }
}

/// Milliseconds since the Unix epoch, like `Date.now()`.
fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as f64)
        .unwrap_or(0.0)
}

/// `Math` as the module expects it. Where JS and Rust disagree (rounding,
/// NaN handling) the JS behaviour wins.
pub(crate) mod math {
    pub type Unary = fn(f64) -> f64;
    pub type Binary = fn(f64, f64) -> f64;

    pub const UNARY: &[(&str, Unary)] = &[
        ("abs", f64::abs),
        ("acos", f64::acos),
        ("acosh", f64::acosh),
        ("asin", f64::asin),
        ("asinh", f64::asinh),
        ("atan", f64::atan),
        ("atanh", f64::atanh),
        ("cbrt", f64::cbrt),
        ("ceil", f64::ceil),
        ("cos", f64::cos),
        ("cosh", f64::cosh),
        ("exp", f64::exp),
        ("expm1", f64::exp_m1),
        ("floor", f64::floor),
        ("fround", fround),
        ("log", f64::ln),
        ("log10", f64::log10),
        ("log1p", f64::ln_1p),
        ("log2", f64::log2),
        ("round", round),
        ("sign", sign),
        ("sin", f64::sin),
        ("sinh", f64::sinh),
        ("sqrt", f64::sqrt),
        ("tan", f64::tan),
        ("tanh", f64::tanh),
        ("trunc", f64::trunc),
    ];

    pub const BINARY: &[(&str, Binary)] = &[
        ("atan2", f64::atan2),
        ("hypot", f64::hypot),
        ("max", max),
        ("min", min),
        ("pow", pow),
    ];

    /// Halves round towards +infinity.
    pub fn round(x: f64) -> f64 {
        let floor = x.floor();
        if x - floor >= 0.5 { floor + 1.0 } else { floor }
    }

    pub fn sign(x: f64) -> f64 {
        if x.is_nan() || x == 0.0 { x } else { x.signum() }
    }

    pub fn fround(x: f64) -> f64 {
        f64::from(x as f32)
    }

    pub fn max(x: f64, y: f64) -> f64 {
        if x.is_nan() || y.is_nan() { f64::NAN } else { x.max(y) }
    }

    pub fn min(x: f64, y: f64) -> f64 {
        if x.is_nan() || y.is_nan() { f64::NAN } else { x.min(y) }
    }

    pub fn pow(x: f64, y: f64) -> f64 {
        if y.is_nan() || (x.abs() == 1.0 && y.is_infinite()) {
            f64::NAN
        } else {
            x.powf(y)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::math;

    #[test]
    fn round_follows_js() {
        assert_eq!(math::round(2.5), 3.0);
        assert_eq!(math::round(-2.5), -2.0);
        assert_eq!(math::round(-2.6), -3.0);
        assert!(math::round(f64::NAN).is_nan());
        assert_eq!(math::round(f64::INFINITY), f64::INFINITY);
    }

    #[test]
    fn max_and_min_propagate_nan() {
        assert!(math::max(1.0, f64::NAN).is_nan());
        assert!(math::min(f64::NAN, 1.0).is_nan());
        assert_eq!(math::max(1.0, 2.0), 2.0);
        assert_eq!(math::min(1.0, 2.0), 1.0);
    }

    #[test]
    fn sign_keeps_zero_and_nan() {
        assert_eq!(math::sign(-3.0), -1.0);
        assert_eq!(math::sign(0.0), 0.0);
        assert!(math::sign(f64::NAN).is_nan());
    }

    #[test]
    fn pow_edge_cases_match_js() {
        assert!(math::pow(1.0, f64::NAN).is_nan());
        assert!(math::pow(1.0, f64::INFINITY).is_nan());
        assert_eq!(math::pow(2.0, 10.0), 1024.0);
    }

    #[test]
    fn fround_rounds_to_single_precision() {
        assert_eq!(math::fround(0.1), f64::from(0.1f32));
    }

    #[test]
    fn names_are_unique() {
        let mut names: Vec<&str> = math::UNARY
            .iter()
            .map(|(name, _)| *name)
            .chain(math::BINARY.iter().map(|(name, _)| *name))
            .collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
    }
}
