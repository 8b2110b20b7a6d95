//! End-to-end tests for relationship fields: inverse maintenance across both
//! kinds, change propagation through related entities, and cascade walks.

use std::sync::Arc;

use fieldgraph::{Entity, EntityRef, EntityType, FieldPath, InterfaceBuilder, Model, ToMany, ToOne};
use fieldgraph::Field;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use proptest::prelude::*;

struct Team;
struct Player;

impl Model for Team {
    const TYPE_NAME: &'static str = "team";

    fn declare(b: &mut InterfaceBuilder) {
        b.identifier("id");
        b.field(Field::<String>::new("name"));
        b.field(ToMany::new::<Player>("players").inverse("team").cascade_delete());
        b.field(ToOne::new::<Player>("captain").inverse("captain_of"));
    }
}

impl Model for Player {
    const TYPE_NAME: &'static str = "player";

    fn declare(b: &mut InterfaceBuilder) {
        b.identifier("id");
        b.field(Field::<String>::new("name"));
        b.field(ToOne::new::<Team>("team").inverse("players").foreign_key());
        b.field(ToOne::new::<Team>("captain_of").inverse("captain").foreign_key());
    }
}

fn team(id: &str) -> EntityRef {
    let t = Entity::new::<Team>();
    t.set_identifier(Some(id.into()));
    t
}

fn player(id: &str) -> EntityRef {
    let p = Entity::new::<Player>();
    p.set_identifier(Some(id.into()));
    p
}

fn roster(t: &EntityRef) -> Vec<String> {
    t.to_many("players")
        .unwrap()
        .get()
        .iter()
        .filter_map(|p| p.identifier())
        .collect()
}

fn team_of(p: &EntityRef) -> Option<String> {
    p.to_one("team").unwrap().get().and_then(|t| t.identifier())
}

// ============================================================================
// 1. Inverses stay paired from either side
// ============================================================================

#[test]
fn test_inverse_pairs_from_either_side() {
    let reds = team("reds");
    let blues = team("blues");
    let (a, b) = (player("a"), player("b"));

    reds.to_many("players").unwrap().set(vec![a.clone(), b.clone()]);
    assert_eq!(team_of(&a).as_deref(), Some("reds"));
    assert_eq!(team_of(&b).as_deref(), Some("reds"));

    b.to_one("team").unwrap().set(Some(blues.clone()));
    assert_eq!(roster(&reds), vec!["a"]);
    assert_eq!(roster(&blues), vec!["b"]);

    blues.to_many("players").unwrap().remove(&b);
    assert_eq!(team_of(&b), None);
}

#[test]
fn test_two_relationships_between_same_types() {
    let reds = team("reds");
    let a = player("a");
    reds.to_many("players").unwrap().push(a.clone());
    reds.to_one("captain").unwrap().set(Some(a.clone()));

    let captain_of = a.to_one("captain_of").unwrap().get().unwrap();
    assert!(Arc::ptr_eq(&captain_of, &reds));

    // Dropping the captaincy leaves membership alone.
    a.to_one("captain_of").unwrap().set(None);
    assert!(reds.to_one("captain").unwrap().get().is_none());
    assert_eq!(roster(&reds), vec!["a"]);
}

// ============================================================================
// 2. Change notification through the graph
// ============================================================================

#[test]
fn test_deep_observation_through_collection() {
    let reds = team("reds");
    let a = player("a");
    reds.to_many("players").unwrap().push(a.clone());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    reds.observe(FieldPath::parse("players").everything_beneath(), move |path| {
        sink.lock().push(path.to_string());
    });

    a.set("name", Some("Ann".to_string())).unwrap();
    reds.set("name", Some("Reds".to_string())).unwrap();

    assert_eq!(*seen.lock(), vec!["players.name".to_string()]);
}

#[test]
fn test_cyclic_notification_terminates() {
    let reds = team("reds");
    let a = player("a");
    reds.to_one("captain").unwrap().set(Some(a.clone()));

    let count = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&count);
    a.observe(FieldPath::parse("name"), move |_| *counter.lock() += 1);

    a.set("name", Some("Ann".to_string())).unwrap();
    assert_eq!(*count.lock(), 1);
}

// ============================================================================
// 3. Cascade
// ============================================================================

#[test]
fn test_cascade_reaches_members_once() {
    let reds = team("reds");
    let players: Vec<EntityRef> = ["a", "b", "c"].into_iter().map(player).collect();
    reds.to_many("players").unwrap().set(players);

    let mut visited = Vec::new();
    reds.cascade_delete(|e| visited.push(e.identifier().unwrap()));
    visited.sort();
    assert_eq!(visited, vec!["a", "b", "c"]);
}

#[test]
fn test_declared_inverses_are_consistent() {
    assert!(EntityType::of::<Team>().check_inverses().is_ok());
    assert!(EntityType::of::<Player>().check_inverses().is_ok());
}

// ============================================================================
// 4. Property: any sequence of moves keeps both sides in agreement
// ============================================================================

#[derive(Debug, Clone)]
enum Move {
    Push { team: usize, player: usize },
    Remove { team: usize, player: usize },
    Assign { player: usize, team: Option<usize> },
}

fn moves() -> impl Strategy<Value = Vec<Move>> {
    let step = prop_oneof![
        (0..3usize, 0..4usize).prop_map(|(team, player)| Move::Push { team, player }),
        (0..3usize, 0..4usize).prop_map(|(team, player)| Move::Remove { team, player }),
        (0..4usize, proptest::option::of(0..3usize)).prop_map(|(player, team)| Move::Assign { player, team }),
    ];
    proptest::collection::vec(step, 0..40)
}

proptest! {
    #[test]
    fn prop_inverse_consistency(steps in moves()) {
        let teams: Vec<EntityRef> = (0..3).map(|i| team(&format!("t{i}"))).collect();
        let players: Vec<EntityRef> = (0..4).map(|i| player(&format!("p{i}"))).collect();

        for step in steps {
            match step {
                Move::Push { team, player } => {
                    teams[team].to_many("players").unwrap().push(players[player].clone());
                }
                Move::Remove { team, player } => {
                    teams[team].to_many("players").unwrap().remove(&players[player]);
                }
                Move::Assign { player, team } => {
                    players[player].to_one("team").unwrap().set(team.map(|t| teams[t].clone()));
                }
            }
        }

        for p in &players {
            let holders: Vec<&EntityRef> = teams
                .iter()
                .filter(|t| t.to_many("players").unwrap().get().iter().any(|m| Arc::ptr_eq(m, p)))
                .collect();
            match p.to_one("team").unwrap().get() {
                Some(t) => {
                    prop_assert_eq!(holders.len(), 1);
                    prop_assert!(Arc::ptr_eq(holders[0], &t));
                }
                None => prop_assert!(holders.is_empty()),
            }
        }
    }
}
