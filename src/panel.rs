pub mod emitter;
pub mod protocol;

pub use emitter::{PanelEmitter, PanelFrame};
pub use protocol::{ClientPanelMessage, ServerPanelMessage};
