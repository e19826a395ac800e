pub mod db;
pub mod evidence;
pub mod io;
pub mod settings;
pub mod tickets;

pub use db::{HivemindDb, RunRecord};

pub use evidence::{EvidenceEntry, EvidenceKind, EvidenceLedger, EvidenceManager};
pub use settings::{StageCounts, SwarmSettings};
pub use tickets::{
    FailOutcome, NewTicket, Ticket, TicketManager, TicketStatus, TicketStore, MAX_TICKET_RETRIES,
};
