use anyhow::Result;
use uuid::Uuid;

use parley_db::Database;
use parley_types::models::RelationshipStatus;

/// Read-only view of the friendship and team services.
pub trait Directory: Send + Sync {
    fn relationship(&self, a: Uuid, b: Uuid) -> Result<Option<RelationshipStatus>>;

    /// Role of the user in the team, or `None` if not a member.
    fn team_role(&self, team_id: Uuid, user_id: Uuid) -> Result<Option<String>>;
}

impl Directory for Database {
    fn relationship(&self, a: Uuid, b: Uuid) -> Result<Option<RelationshipStatus>> {
        self.get_relationship(a, b)
    }

    fn team_role(&self, team_id: Uuid, user_id: Uuid) -> Result<Option<String>> {
        self.get_team_role(team_id, user_id)
    }
}
