use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::{Entity, EntityRef};

use super::resource::Resource;

/// Id of a field that may be a bare id or a populated object.
fn ref_id(value: &Option<Value>) -> Option<String> {
  value.as_ref().and_then(EntityRef::from_value)?.id()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
  Pending,
  Confirmed,
  InProgress,
  Done,
  Cancelled,
  NoShow,
  #[serde(other)]
  Unknown,
}

/// A booked visit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
  #[serde(rename = "_id", alias = "id")]
  pub id: String,
  /// Client reference, either an id or the populated client
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub client: Option<Value>,
  pub status: AppointmentStatus,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub start_time: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub notes: Option<String>,
}

impl Appointment {
  pub fn client_id(&self) -> Option<String> {
    ref_id(&self.client)
  }
}

impl Entity for Appointment {
  fn resource() -> &'static str {
    Resource::Appointments.as_str()
  }

  fn entity_id(&self) -> String {
    self.id.clone()
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
  #[serde(rename = "_id", alias = "id")]
  pub id: String,
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub email: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub phone: Option<String>,
}

impl Entity for Client {
  fn resource() -> &'static str {
    Resource::Clients.as_str()
  }

  fn entity_id(&self) -> String {
    self.id.clone()
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
  #[serde(rename = "_id", alias = "id")]
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub client: Option<Value>,
  /// Total in the clinic's currency
  #[serde(default)]
  pub amount: f64,
  /// "draft", "issued", "paid", ...
  pub status: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub issued_at: Option<DateTime<Utc>>,
}

impl Invoice {
  pub fn client_id(&self) -> Option<String> {
    ref_id(&self.client)
  }

  pub fn is_paid(&self) -> bool {
    self.status.eq_ignore_ascii_case("paid")
  }
}

impl Entity for Invoice {
  fn resource() -> &'static str {
    Resource::Invoices.as_str()
  }

  fn entity_id(&self) -> String {
    self.id.clone()
  }
}

/// One step of a treatment plan, tied to an appointment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreatmentStage {
  #[serde(rename = "_id", alias = "id")]
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub appointment: Option<Value>,
  pub name: String,
  pub status: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub updated_at: Option<DateTime<Utc>>,
}

impl TreatmentStage {
  pub fn appointment_id(&self) -> Option<String> {
    ref_id(&self.appointment)
  }
}

impl Entity for TreatmentStage {
  fn resource() -> &'static str {
    Resource::TreatmentStages.as_str()
  }

  fn entity_id(&self) -> String {
    self.id.clone()
  }
}
