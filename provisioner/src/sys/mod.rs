// 🛡️ Every host mutation goes through one of these modules; the orchestrator
// only sequences them.

pub mod traits;     // Global contracts
pub mod exec;       // External tool execution
pub mod preflight;  // Privilege + operator identity
pub mod packages;   // apt + NodeSource
pub mod layout;     // Install root, backups, ownership
pub mod secrets;    // Memory hygiene (signing key, admin credentials)
pub mod systemd;    // Backend unit
pub mod backend;    // FastAPI venv + sources
pub mod frontend;   // SPA build
pub mod proxy;      // Ingress (Nginx)
pub mod ssl;        // Certificate management
pub mod scheduler;  // Timer scheduling

#[cfg(test)]
pub mod testing;
