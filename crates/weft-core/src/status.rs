//! Lifecycle tri-state shared by connections and listeners.

/// Lifecycle status of a connection or listener.
///
/// The TCP and channel transports bind or connect during construction,
/// so their handles report [`Status::Started`] from the moment they
/// exist. [`Status::Created`] is reserved for transports that defer
/// binding or connecting until an explicit start step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Constructed but not yet serving. Unused by transports that bind
    /// or connect in their constructors.
    Created,
    /// Actively serving.
    Started,
    /// Closed or stopped; terminal.
    Stopped,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}
