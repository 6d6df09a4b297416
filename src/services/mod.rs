pub mod inventory;
pub mod orders;
pub mod packing;
pub mod picking;

pub use inventory::InventoryService;
pub use orders::OrderService;
pub use packing::PackingService;
pub use picking::PickingSessionService;
