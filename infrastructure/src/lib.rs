// Module declarations
pub mod persistence;

#[cfg(test)]
mod sync_scenarios;

// Re-export implementations
pub use persistence::InMemoryDocumentStore;
