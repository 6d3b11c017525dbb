//! Hardware abstraction: numeric kernels the layers are lowered onto.

pub mod cpu;
