//! The stack virtual machine (spec.md §4.4): call frames, closures, upvalue
//! capture/close, class/instance/method/bound-method dispatch, and the
//! native-function bridge (§4.8).
//!
//! `loxc-compiler` turns source into a `Function`; this crate is what runs
//! it. The split mirrors `faxc-runtime`'s own boundary: compilation and
//! execution are separate crates sharing only the data model in `loxc-gc`.

mod vm;

pub mod stdlib;

pub use vm::{CallFrame, InterpretResult, Vm, VmConfig};
