pub mod motion;
pub mod params;
pub mod state;
pub mod units;

pub use params::{
    HomeDirection, JogDirection, ParameterStore, PersistKind, SlotParameters, SoftLimitMode, SoftLimits,
};
pub use state::{MotionState, Slot, SlotTable, Transition};
pub use units::{StageParams, UnitConverter};
