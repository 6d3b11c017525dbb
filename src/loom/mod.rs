//! The `loom` module provides the data model of the engine: tensors, their layouts, and views.
//!
//! ## Key Components
//! 1. **Layouts** (`Layout`, `Shape`):
//!    - Shape metadata with per-dimension strides.
//!    - Shape utilities: totals, equality, concatenation.
//!
//! 2. **Tensors** (`Tensor`):
//!    - Reference-counted `f32` buffers shared between a tensor and its views.
//!    - Run-time checked read/write access through lock guards.
//!
//! 3. **Views** (`Slice`, `Axis`):
//!    - Range restrictions of the leading dimensions, without copying.
//!    - Per-sample, per-channel planes.

pub mod layout;
pub mod slice;
pub mod tensor;
