pub mod allocation;
pub mod capital_structure;
pub mod schedule;

pub use allocation::{
    allocate, calculate_opm_allocation, class_fmv, class_fmv_asymptote, Allocation, FmvResult,
    OpmAllocationInput,
};
pub use capital_structure::{build_share_classes, CapitalStructure, SecurityClass, SecurityTerms};
pub use schedule::{
    calculate_breakpoints, derive_breakpoints, validate_schedule, validate_share_classes,
    Breakpoint, BreakpointInput, BreakpointSchedule, CapitalStructureInput, ClassSummary,
    ParticipationRule, ShareClass, ShareParticipation,
};
