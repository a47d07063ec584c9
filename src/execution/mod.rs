// Order execution: signal orders, the pending-order lifecycle and live position upkeep
pub mod executor;
pub mod order_manager;
pub mod position_manager;
pub mod stamp;

pub use executor::{ExecutionAction, ExecutionDecision, Executor};
pub use order_manager::{
    EntryPolicy, ExpiryPolicy, OrderLifecycleManager, OrderManagerConfig, OrderState,
    PlacementFailure, PlannedOrder, ReconcileReport, SkipReason, StopPolicy, Transition,
};
pub use position_manager::{breakeven_stop, tightened_stop, ExitReason, PositionManager};
