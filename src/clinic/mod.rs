//! Clinic backend: resources, domain types and the REST transport.

pub mod api_types;
pub mod client;
pub mod resource;
pub mod types;

pub use client::ClinicClient;
pub use resource::Resource;
pub use types::{Appointment, AppointmentStatus, Client, Invoice, TreatmentStage};
