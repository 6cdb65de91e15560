use relay_shared::ClientId;
use std::collections::HashSet;

/// A named subgroup inside a room. Teams are created when the first client
/// asks for them and the room drops them once they are empty.
#[derive(Debug, Clone)]
pub struct Team {
    /// Team id as taken from the client state's `teamId`
    id: String,
    /// Identities of the room members on this team
    members: HashSet<ClientId>,
}

impl Team {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            members: HashSet::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn add(&mut self, client_id: ClientId) {
        self.members.insert(client_id);
    }

    pub fn remove(&mut self, client_id: ClientId) -> bool {
        self.members.remove(&client_id)
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.members.contains(&client_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Member ids in ascending order
    pub fn members(&self) -> Vec<ClientId> {
        let mut members: Vec<ClientId> = self.members.iter().copied().collect();
        members.sort_unstable();
        members
    }
}
