use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of a monitoring event. The serialized values are the stable wire
/// values stored in `monitoring_events.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "Sistema Ativado")]
    SystemActivated,
    #[serde(rename = "Portaria Online")]
    GatehouseOnline,
    #[serde(rename = "Portaria Offline")]
    GatehouseOffline,
    /// Raised by the compliance scheduler when a shift transition was missed.
    #[serde(rename = "Local Sem Internet")]
    LocalSemInternet,
    #[serde(rename = "Falha do Vigilante")]
    VigilantFailure,
    #[serde(rename = "Botão de Pânico")]
    PanicButton,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::SystemActivated,
        EventKind::GatehouseOnline,
        EventKind::GatehouseOffline,
        EventKind::LocalSemInternet,
        EventKind::VigilantFailure,
        EventKind::PanicButton,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SystemActivated => "Sistema Ativado",
            EventKind::GatehouseOnline => "Portaria Online",
            EventKind::GatehouseOffline => "Portaria Offline",
            EventKind::LocalSemInternet => "Local Sem Internet",
            EventKind::VigilantFailure => "Falha do Vigilante",
            EventKind::PanicButton => "Botão de Pânico",
        }
    }

    /// Distress and failure kinds, the ones that ring the alert tone.
    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            EventKind::PanicButton | EventKind::VigilantFailure | EventKind::LocalSemInternet
        )
    }

    /// Kinds that leave a post presumed staffed when they are its latest event.
    pub fn implies_on_duty(&self) -> bool {
        matches!(
            self,
            EventKind::SystemActivated | EventKind::GatehouseOnline | EventKind::VigilantFailure
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("Unknown event kind: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventStatus {
    #[serde(rename = "Não Resolvido")]
    Unresolved,
    #[serde(rename = "Resolvido")]
    Resolved,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Unresolved => "Não Resolvido",
            EventStatus::Resolved => "Resolvido",
        }
    }

    pub fn toggled(&self) -> Self {
        match self {
            EventStatus::Unresolved => EventStatus::Resolved,
            EventStatus::Resolved => EventStatus::Unresolved,
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Não Resolvido" => Ok(EventStatus::Unresolved),
            "Resolvido" => Ok(EventStatus::Resolved),
            _ => Err(format!("Unknown event status: {s}")),
        }
    }
}
