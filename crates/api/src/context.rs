use docflow_core::Owner;

/// Authenticated caller for a request.
///
/// Inserted by the auth middleware; every job route requires it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerContext {
    owner: Owner,
}

impl OwnerContext {
    pub fn new(owner: Owner) -> Self {
        Self { owner }
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }
}
