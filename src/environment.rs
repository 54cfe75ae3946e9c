/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/environment.rs
*
* Namespace lifecycle for a team, expressed over the `Team` record and the
* cluster's `Namespace` objects.
*
* Creating an environment creates its namespace (an existing one is fine) and
* records its role on the team. Destroying one requests namespace deletion and
* clears the role; callers verify the namespace is actually gone with
* `namespace_exists`, since namespace deletion completes asynchronously.
*
* Force-destroying the active environment deliberately leaves `active` on the
* team untouched: a rollback re-promotes whatever the team still records.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::clock::Clock;
use crate::crds::{set_condition, Team, TeamCondition, TEAM_LABEL};
use crate::errors::{Error, ResultExt};
use crate::store::{ignore_not_found, label, Store};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::ObjectMeta;
use std::sync::Arc;
use tracing::info;

#[async_trait]
pub trait EnvironmentController: Send + Sync {
    async fn get_team(&self, team: &str) -> Result<Team, Error>;

    async fn create_pre_active_environment(&self, team: &str, namespace: &str) -> Result<(), Error>;

    /// Makes `namespace` the team's active namespace, creating it if needed.
    /// The former active namespace becomes the previous active one.
    async fn promote_active_environment(
        &self,
        team: &str,
        namespace: &str,
        promoted_by: Option<&str>,
    ) -> Result<(), Error>;

    async fn destroy_active_environment(&self, team: &str, namespace: &str) -> Result<(), Error>;

    async fn destroy_pre_active_environment(&self, team: &str, namespace: &str) -> Result<(), Error>;

    async fn destroy_previous_active_environment(&self, team: &str, namespace: &str) -> Result<(), Error>;

    async fn set_active_namespace(&self, team: &str, namespace: &str) -> Result<(), Error>;

    async fn set_previous_active_namespace(&self, team: &str, namespace: &str) -> Result<(), Error>;

    async fn create_pull_request_environment(&self, team: &str, namespace: &str) -> Result<(), Error>;

    async fn destroy_pull_request_environment(&self, team: &str, namespace: &str) -> Result<(), Error>;

    async fn namespace_exists(&self, namespace: &str) -> Result<bool, Error>;
}

pub struct StoreEnvironment {
    teams: Arc<dyn Store<Team>>,
    namespaces: Arc<dyn Store<Namespace>>,
    clock: Arc<dyn Clock>,
}

impl StoreEnvironment {
    pub fn new(teams: Arc<dyn Store<Team>>, namespaces: Arc<dyn Store<Namespace>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            teams,
            namespaces,
            clock,
        }
    }

    async fn ensure_namespace(&self, team: &str, namespace: &str) -> Result<(), Error> {
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                labels: Some(label(TEAM_LABEL, team)),
                ..Default::default()
            },
            ..Default::default()
        };
        match self.namespaces.create(&ns).await {
            Ok(_) => {
                info!(team, namespace, "Namespace created.");
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<(), Error> {
        if namespace.is_empty() {
            return Ok(());
        }
        ignore_not_found(self.namespaces.delete(None, namespace).await)
            .context(|| format!("deleting namespace '{}'", namespace))?;
        info!(namespace, "Namespace deletion requested.");
        Ok(())
    }

    /// Read-modify-write on the team status.
    async fn update_team(&self, team: &str, mutate: impl FnOnce(&mut Team) + Send) -> Result<(), Error> {
        let mut record = self.get_team(team).await?;
        mutate(&mut record);
        self.teams
            .update(&record)
            .await
            .context(|| format!("updating team '{}'", team))?;
        Ok(())
    }
}

#[async_trait]
impl EnvironmentController for StoreEnvironment {
    async fn get_team(&self, team: &str) -> Result<Team, Error> {
        Ok(self.teams.get(None, team).await?)
    }

    async fn create_pre_active_environment(&self, team: &str, namespace: &str) -> Result<(), Error> {
        self.ensure_namespace(team, namespace).await?;
        let now = self.clock.now();
        self.update_team(team, |t| {
            let status = t.status_mut();
            status.namespace.pre_active = namespace.to_string();
            set_condition(
                &mut status.conditions,
                TeamCondition::PreActiveEnvironmentCreated,
                true,
                format!("pre-active environment '{}' created", namespace),
                now,
            );
        })
        .await
    }

    async fn promote_active_environment(
        &self,
        team: &str,
        namespace: &str,
        promoted_by: Option<&str>,
    ) -> Result<(), Error> {
        self.ensure_namespace(team, namespace).await?;
        let now = self.clock.now();
        self.update_team(team, |t| {
            let status = t.status_mut();
            let ns = &mut status.namespace;
            if ns.active != namespace {
                ns.previous_active = std::mem::take(&mut ns.active);
                ns.active = namespace.to_string();
            }
            if ns.pre_active == namespace {
                ns.pre_active.clear();
            }
            status.active_promoted_by = promoted_by.map(String::from);
            set_condition(
                &mut status.conditions,
                TeamCondition::ActiveEnvironmentPromoted,
                true,
                format!("'{}' is active", namespace),
                now,
            );
        })
        .await
    }

    async fn destroy_active_environment(&self, _team: &str, namespace: &str) -> Result<(), Error> {
        self.delete_namespace(namespace).await
    }

    async fn destroy_pre_active_environment(&self, team: &str, namespace: &str) -> Result<(), Error> {
        self.delete_namespace(namespace).await?;
        self.update_team(team, |t| {
            let ns = &mut t.status_mut().namespace;
            if ns.pre_active == namespace {
                ns.pre_active.clear();
            }
        })
        .await
    }

    async fn destroy_previous_active_environment(&self, team: &str, namespace: &str) -> Result<(), Error> {
        self.delete_namespace(namespace).await?;
        self.update_team(team, |t| {
            let ns = &mut t.status_mut().namespace;
            if ns.previous_active == namespace {
                ns.previous_active.clear();
            }
        })
        .await
    }

    async fn set_active_namespace(&self, team: &str, namespace: &str) -> Result<(), Error> {
        self.update_team(team, |t| t.status_mut().namespace.active = namespace.to_string())
            .await
    }

    async fn set_previous_active_namespace(&self, team: &str, namespace: &str) -> Result<(), Error> {
        self.update_team(team, |t| {
            t.status_mut().namespace.previous_active = namespace.to_string()
        })
        .await
    }

    async fn create_pull_request_environment(&self, team: &str, namespace: &str) -> Result<(), Error> {
        self.ensure_namespace(team, namespace).await?;
        self.update_team(team, |t| {
            let prs = &mut t.status_mut().namespace.pull_requests;
            if !prs.iter().any(|p| p == namespace) {
                prs.push(namespace.to_string());
            }
        })
        .await
    }

    async fn destroy_pull_request_environment(&self, team: &str, namespace: &str) -> Result<(), Error> {
        self.delete_namespace(namespace).await?;
        self.update_team(team, |t| {
            t.status_mut().namespace.pull_requests.retain(|p| p != namespace)
        })
        .await
    }

    async fn namespace_exists(&self, namespace: &str) -> Result<bool, Error> {
        Ok(self.namespaces.find(None, namespace).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::crds::{TeamSpec, TeamStatus};
    use crate::store::MemoryStore;

    async fn setup(active: &str) -> (StoreEnvironment, Arc<MemoryStore<Team>>) {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let teams = Arc::new(MemoryStore::<Team>::new(clock.clone()));
        let mut team = Team::new("alpha", TeamSpec::default());
        team.status = Some(TeamStatus::default());
        team.status_mut().namespace.active = active.to_string();
        teams.create(&team).await.unwrap();
        let namespaces = Arc::new(MemoryStore::<Namespace>::new(clock.clone()));
        (StoreEnvironment::new(teams.clone(), namespaces, clock), teams)
    }

    #[tokio::test]
    async fn test_promote_moves_active_to_previous() {
        let (env, teams) = setup("s2h-alpha-a").await;
        env.create_pre_active_environment("alpha", "s2h-alpha-b").await.unwrap();
        assert_eq!(teams.get(None, "alpha").await.unwrap().namespaces().pre_active, "s2h-alpha-b");

        env.promote_active_environment("alpha", "s2h-alpha-b", Some("ci")).await.unwrap();
        let ns = teams.get(None, "alpha").await.unwrap().namespaces();
        assert_eq!(ns.active, "s2h-alpha-b");
        assert_eq!(ns.previous_active, "s2h-alpha-a");
        assert!(ns.pre_active.is_empty());

        // Promoting the active namespace again keeps the previous one.
        env.promote_active_environment("alpha", "s2h-alpha-b", None).await.unwrap();
        assert_eq!(teams.get(None, "alpha").await.unwrap().namespaces().previous_active, "s2h-alpha-a");
    }

    #[tokio::test]
    async fn test_destroy_active_keeps_team_record() {
        let (env, teams) = setup("s2h-alpha-a").await;
        env.promote_active_environment("alpha", "s2h-alpha-a", None).await.unwrap();
        assert!(env.namespace_exists("s2h-alpha-a").await.unwrap());

        env.destroy_active_environment("alpha", "s2h-alpha-a").await.unwrap();
        env.destroy_active_environment("alpha", "s2h-alpha-a").await.unwrap();
        assert!(!env.namespace_exists("s2h-alpha-a").await.unwrap());
        assert_eq!(teams.get(None, "alpha").await.unwrap().namespaces().active, "s2h-alpha-a");
    }

    #[tokio::test]
    async fn test_pull_request_environments_are_tracked() {
        let (env, teams) = setup("").await;
        env.create_pull_request_environment("alpha", "s2h-alpha-wordpress-7").await.unwrap();
        env.create_pull_request_environment("alpha", "s2h-alpha-wordpress-7").await.unwrap();
        assert_eq!(teams.get(None, "alpha").await.unwrap().namespaces().pull_requests.len(), 1);

        env.destroy_pull_request_environment("alpha", "s2h-alpha-wordpress-7").await.unwrap();
        assert!(teams.get(None, "alpha").await.unwrap().namespaces().pull_requests.is_empty());
    }
}
