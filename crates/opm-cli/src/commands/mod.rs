pub mod assumptions;
pub mod backsolve;
pub mod breakpoints;
pub mod hybrid;
pub mod sensitivity;
