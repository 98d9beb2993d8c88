//! Adapter implementations for the ports.

pub mod inmem_orders;
pub mod simulated;

pub use inmem_orders::InMemoryOrderRepository;
pub use simulated::{SimulatedEmailSender, SimulatedPaymentGateway};
