pub mod grid;

pub use grid::{
    calculate_sensitivity_grid, OpmSensitivityInput, SensitivityGrid, SensitivityParameter,
    SensitivityVariable,
};
