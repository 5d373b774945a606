pub mod app;
pub mod attempt;
pub mod broadcast;
pub mod cart;
pub mod checkout_handlers;
pub mod codec;
pub mod config;
pub mod controller;
pub mod draft;
pub mod error;
pub mod initiator;
pub mod model;
pub mod order_client;
pub mod payment_client;
pub mod poller;
pub mod reconciler;
pub mod state;

pub use app::{build_router, build_state, AppState};
pub use config::CheckoutConfig;
pub use controller::{Collaborators, ControllerSettings, PaymentStateController};
