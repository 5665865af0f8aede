//! Native functions installed into every fresh [`Vm`] (spec.md §4.8).
//!
//! Each native is a plain `fn(&Heap, &[Value]) -> Result<Value, String>`:
//! the error case is a message string, which `Vm::call_native` wraps into a
//! proper `RuntimeError` with a backtrace the same way any other opcode
//! failure is wrapped.

use std::time::{SystemTime, UNIX_EPOCH};

use loxc_gc::{Heap, ObjKind, Value};

use crate::Vm;

pub fn install(vm: &mut Vm) {
    vm.define_native("clock", clock);
    vm.define_native("str_len", str_len);
}

/// Seconds since the Unix epoch, as an `f64` (spec.md §4.8). A wall-clock
/// reading rather than a monotonic one, matching what a Lox script calling
/// `clock()` twice and subtracting actually expects to measure.
fn clock(_heap: &Heap, _args: &[Value]) -> Result<Value, String> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| "System clock is set before the Unix epoch.".to_string())?;
    Ok(Value::Number(elapsed.as_secs_f64()))
}

/// Returns the byte length of a string argument (spec.md §4.8).
fn str_len(heap: &Heap, args: &[Value]) -> Result<Value, String> {
    let arg = args
        .first()
        .ok_or_else(|| "str_len() expects 1 argument.".to_string())?;
    match arg {
        Value::Obj(r) => match heap.kind(*r) {
            ObjKind::String(s) => Ok(Value::Number(s.as_str().len() as f64)),
            _ => Err("str_len() expects a string.".to_string()),
        },
        _ => Err("str_len() expects a string.".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InterpretResult, VmConfig};

    #[test]
    fn clock_returns_a_positive_number_through_a_running_script() {
        let mut vm = Vm::new(VmConfig::default());
        let result = vm.interpret("var t = clock(); if (t < 0) { print \"bad\"; }");
        assert!(matches!(result, InterpretResult::Ok));
    }

    #[test]
    fn str_len_counts_bytes() {
        let heap = Heap::new(loxc_gc::GcConfig::default());
        let mut heap = heap;
        let s = heap.copy_string("hello", &loxc_gc::Roots::default());
        assert_eq!(str_len(&heap, &[Value::Obj(s)]), Ok(Value::Number(5.0)));
    }

    #[test]
    fn str_len_rejects_a_non_string_argument() {
        let heap = Heap::new(loxc_gc::GcConfig::default());
        assert!(str_len(&heap, &[Value::Number(1.0)]).is_err());
    }
}
