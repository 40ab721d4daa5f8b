//! Typed resources for the journey domain.

use serde_json::Value;
use uuid::Uuid;

use crate::application::catalog;
use crate::application::context::QueryClient;
use crate::application::resource::{Resource, ResourceSpec};
use crate::cache::KeyParams;
use crate::domain::entities::{
    Mission, MissionPatch, NewMission, NewPost, NewTeam, Post, PostPatch, Team, TeamPatch,
};
use crate::query::QueryHandle;

pub type TeamResource = Resource<Team, NewTeam, TeamPatch>;
pub type PostResource = Resource<Post, NewPost, PostPatch>;
pub type MissionResource = Resource<Mission, NewMission, MissionPatch>;
/// Untyped rows for tables without a domain entity.
pub type TableResource = Resource<Value, Value, Value>;

pub fn teams(client: &QueryClient) -> TeamResource {
    client.resource(catalog::teams())
}

pub fn posts(client: &QueryClient) -> PostResource {
    client.resource(catalog::posts())
}

pub fn missions(client: &QueryClient) -> MissionResource {
    client.resource(catalog::missions())
}

pub fn table(client: &QueryClient, spec: ResourceSpec) -> TableResource {
    client.resource(spec)
}

/// Posts of one team. Stays disabled until the team is known.
pub fn team_posts(client: &QueryClient, team_id: Option<Uuid>) -> QueryHandle<Vec<Post>> {
    let conditions = team_id.map(|id| KeyParams::new().with("team_id", id));
    posts(client).list_where(conditions)
}

/// Missions scheduled for one week.
pub fn week_missions(client: &QueryClient, week_id: i64) -> QueryHandle<Vec<Mission>> {
    missions(client).list_where(KeyParams::new().with("week_id", week_id))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use crate::application::remote::RemoteStore;
    use crate::cache::CacheConfig;
    use crate::infra::memory::InMemoryStore;

    use super::*;

    fn client(store: Arc<InMemoryStore>) -> QueryClient {
        QueryClient::new(CacheConfig::default(), store)
    }

    #[tokio::test]
    async fn team_posts_waits_for_a_team() {
        let store = Arc::new(InMemoryStore::new().with_table("posts", "id"));
        let client = client(Arc::clone(&store));

        let handle = team_posts(&client, None);
        assert!(!handle.is_enabled());
        assert!(handle.data().is_none());
        assert!(client.store().is_empty());
    }

    #[tokio::test]
    async fn team_posts_filters_by_team() {
        let store = Arc::new(InMemoryStore::new().with_table("posts", "id"));
        let team = Uuid::new_v4();
        store
            .insert(
                "posts",
                vec![
                    json!({ "team_id": team.to_string(), "title": "Kickoff", "status": "published" }),
                    json!({ "team_id": Uuid::new_v4().to_string(), "title": "Elsewhere" }),
                ],
            )
            .await
            .expect("seed posts");
        let client = client(Arc::clone(&store));

        let mut handle = team_posts(&client, Some(team));
        let state = handle.settled().await;

        let posts = state.data.expect("posts loaded");
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].title, "Kickoff");
        assert_eq!(posts[0].team_id, Some(team));
    }
}
