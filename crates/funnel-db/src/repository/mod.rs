//! # Repository Module
//!
//! Database repository implementations for the lead store.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repository Layout                                    │
//! │                                                                         │
//! │  SyncEngine / HTTP handler                                             │
//! │       │                                                                 │
//! │       │  db.leads().query("acme", &query)                              │
//! │       ▼                                                                 │
//! │  LeadRepository                                                        │
//! │  ├── sync(&self, tenant, leads, is_full)                               │
//! │  ├── apply(&self, tenant, leads)                                       │
//! │  ├── query(&self, tenant, query)                                       │
//! │  ├── funnel_counts(&self, tenant)                                      │
//! │  └── soft_delete_ids(&self, tenant, ids)                               │
//! │       │                                                                 │
//! │       │  records every sync through                                    │
//! │       ▼                                                                 │
//! │  SyncStateRepository                                                   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! │                                                                         │
//! │  Every statement is scoped by tenant_id.                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`lead::LeadRepository`] - Lead upserts, soft deletes and listings
//! - [`sync_state::SyncStateRepository`] - Latest sync report per tenant

pub mod lead;
pub mod sync_state;
