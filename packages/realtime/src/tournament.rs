//! Tournament room provisioning policy
//!
//! Thin layer over [`RoomRouter`] encoding the room-naming conventions a
//! tournament uses: one main room, one room per match, and one admin room.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::rooms::{RoomRouter, RoomType};

/// Room ids provisioned for a tournament
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TournamentRooms {
    pub main: String,
    pub admin: String,
    pub matches: Vec<String>,
}

pub fn main_room_id(tournament_id: &str) -> String {
    format!("tournament-{tournament_id}")
}

pub fn admin_room_id(tournament_id: &str) -> String {
    format!("private-tournament-{tournament_id}-admin")
}

pub fn match_room_id(match_id: &str) -> String {
    format!("match-{match_id}")
}

/// Policy layer mapping tournament structure onto rooms
pub struct TournamentRoomManager {
    router: Arc<RoomRouter>,
}

impl TournamentRoomManager {
    pub fn new(router: Arc<RoomRouter>) -> Self {
        Self { router }
    }

    /// Provision the conventional room triad for a tournament. Idempotent;
    /// re-provisioning with extra matches adds only the missing rooms.
    pub fn create_tournament_rooms(
        &self,
        tournament_id: &str,
        tournament_name: &str,
        match_ids: &[&str],
    ) -> TournamentRooms {
        let main = main_room_id(tournament_id);
        let admin = admin_room_id(tournament_id);
        let metadata = json!({ "tournament_id": tournament_id });

        self.router
            .create_room(&main, tournament_name, RoomType::Tournament, metadata.clone());
        self.router.create_room(
            &admin,
            &format!("{tournament_name} (admin)"),
            RoomType::Private,
            metadata.clone(),
        );

        let matches = match_ids
            .iter()
            .map(|match_id| {
                let room_id = match_room_id(match_id);
                self.router.create_room(
                    &room_id,
                    &format!("Match {match_id}"),
                    RoomType::Match,
                    json!({ "tournament_id": tournament_id, "match_id": match_id }),
                );
                room_id
            })
            .collect();

        tracing::info!(
            tournament_id = %tournament_id,
            match_count = match_ids.len(),
            "tournament rooms provisioned"
        );
        TournamentRooms { main, admin, matches }
    }

    /// Join a team to the tournament's main room plus its scheduled match
    /// rooms. Returns the rooms actually joined.
    pub fn auto_join_team_rooms(
        &self,
        tournament_id: &str,
        team_id: &str,
        scheduled_match_ids: &[&str],
    ) -> Vec<String> {
        let info = json!({ "team_id": team_id });
        let mut joined = Vec::new();

        let main = main_room_id(tournament_id);
        if self.router.join_room(&main, team_id, Some(info.clone())) {
            joined.push(main);
        }
        for match_id in scheduled_match_ids {
            let room_id = match_room_id(match_id);
            if self.router.join_room(&room_id, team_id, Some(info.clone())) {
                joined.push(room_id);
            }
        }
        joined
    }

    /// Fan a tournament event out: to the main room unless admin-only,
    /// always to the admin room, optionally to every match room. Returns
    /// the total number of callbacks invoked.
    pub fn broadcast_tournament_event(
        &self,
        tournament_id: &str,
        event: &str,
        data: Value,
        admin_only: bool,
        include_matches: bool,
    ) -> usize {
        let mut delivered = 0;
        if !admin_only {
            delivered +=
                self.router
                    .broadcast_to_room(&main_room_id(tournament_id), event, data.clone(), None);
        }
        delivered += self.router.broadcast_to_room(
            &admin_room_id(tournament_id),
            event,
            data.clone(),
            None,
        );
        if include_matches {
            for room_id in self.router.list_rooms() {
                let is_tournament_match = self
                    .router
                    .room(&room_id)
                    .map(|r| {
                        r.room_type == RoomType::Match
                            && r.metadata.get("tournament_id").and_then(Value::as_str)
                                == Some(tournament_id)
                    })
                    .unwrap_or(false);
                if is_tournament_match {
                    delivered += self.router.broadcast_to_room(&room_id, event, data.clone(), None);
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::WILDCARD;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> (TournamentRoomManager, Arc<RoomRouter>) {
        let router = Arc::new(RoomRouter::new());
        (TournamentRoomManager::new(Arc::clone(&router)), router)
    }

    #[test]
    fn test_create_tournament_rooms_provisions_triad() {
        let (manager, router) = manager();

        let rooms = manager.create_tournament_rooms("42", "Summer Open", &["m1", "m2"]);

        assert_eq!(rooms.main, "tournament-42");
        assert_eq!(rooms.admin, "private-tournament-42-admin");
        assert_eq!(rooms.matches, vec!["match-m1", "match-m2"]);
        assert_eq!(router.list_rooms().len(), 4);
        assert_eq!(router.room("tournament-42").unwrap().room_type, RoomType::Tournament);
        assert_eq!(
            router.room("private-tournament-42-admin").unwrap().room_type,
            RoomType::Private
        );
    }

    #[test]
    fn test_reprovisioning_adds_only_missing_matches() {
        let (manager, router) = manager();

        manager.create_tournament_rooms("42", "Summer Open", &["m1"]);
        let rooms = manager.create_tournament_rooms("42", "Summer Open", &["m1", "m2"]);

        assert_eq!(rooms.matches.len(), 2);
        assert_eq!(router.list_rooms().len(), 4);
    }

    #[test]
    fn test_auto_join_team_rooms() {
        let (manager, router) = manager();
        manager.create_tournament_rooms("42", "Summer Open", &["m1", "m2"]);

        let joined = manager.auto_join_team_rooms("42", "team-7", &["m2"]);

        assert_eq!(joined, vec!["tournament-42", "match-m2"]);
        assert_eq!(router.members("tournament-42").len(), 1);
        assert!(router.members("match-m1").is_empty());
        assert_eq!(router.members("match-m2")[0].id, "team-7");
    }

    #[test]
    fn test_broadcast_routing_respects_admin_only() {
        let (manager, router) = manager();
        manager.create_tournament_rooms("42", "Summer Open", &["m1"]);

        let main_hits = Arc::new(AtomicUsize::new(0));
        let admin_hits = Arc::new(AtomicUsize::new(0));
        let match_hits = Arc::new(AtomicUsize::new(0));
        let hooks = [
            ("tournament-42", Arc::clone(&main_hits)),
            ("private-tournament-42-admin", Arc::clone(&admin_hits)),
            ("match-m1", Arc::clone(&match_hits)),
        ];
        let guards: Vec<_> = hooks
            .iter()
            .map(|(room, hits)| {
                let hits = Arc::clone(hits);
                router.subscribe(
                    room,
                    &[WILDCARD],
                    Arc::new(move |_| {
                        hits.fetch_add(1, Ordering::SeqCst);
                    }),
                )
            })
            .collect();

        manager.broadcast_tournament_event("42", "bracket-update", Value::Null, true, false);
        assert_eq!(main_hits.load(Ordering::SeqCst), 0);
        assert_eq!(admin_hits.load(Ordering::SeqCst), 1);

        manager.broadcast_tournament_event("42", "score-update", Value::Null, false, true);
        assert_eq!(main_hits.load(Ordering::SeqCst), 1);
        assert_eq!(admin_hits.load(Ordering::SeqCst), 2);
        assert_eq!(match_hits.load(Ordering::SeqCst), 1);

        for g in guards {
            g.unsubscribe();
        }
    }

    #[test]
    fn test_match_rooms_from_other_tournaments_excluded() {
        let (manager, router) = manager();
        manager.create_tournament_rooms("42", "Summer Open", &["m1"]);
        manager.create_tournament_rooms("43", "Winter Cup", &["m9"]);

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_inner = Arc::clone(&hits);
        let guard = router.subscribe(
            "match-m9",
            &[WILDCARD],
            Arc::new(move |_| {
                hits_inner.fetch_add(1, Ordering::SeqCst);
            }),
        );

        manager.broadcast_tournament_event("42", "score-update", Value::Null, false, true);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        guard.unsubscribe();
    }
}
