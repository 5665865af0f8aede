//! The object model, bytecode chunk, hash table, and garbage-collected
//! heap shared by `loxc-compiler` and `loxc-runtime` (spec.md §3, §4.5,
//! §4.7).

pub mod chunk;
mod intern;
pub mod heap;
pub mod object;
pub mod table;
pub mod value;

pub use chunk::{Chunk, OpCode};
pub use heap::{fnv1a_hash, GcConfig, Heap, HeapStats, Roots};
pub use object::{
    BoundMethod, Class, Closure, GcRef, Instance, LoxFunction, LoxString, NativeFn, NativeFnPtr,
    ObjKind, Upvalue, UpvalueState,
};
pub use table::Table;
pub use value::{format_number, is_falsey, Value};
