pub mod addr;
pub mod conditional;
pub mod eval;
pub mod model;
pub mod refs;
pub mod validation;

#[cfg(test)]
pub mod harness;
