use axum::{routing::{get, post}, Router};
use rand::seq::IndexedRandom;

use crate::AppState;

mod identify;
mod logout;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/identify", post(identify::identify))
        .route("/me", get(identify::me))
        .route("/logout", post(logout::logout))
}

const MAX_NAME_LEN: usize = 64;

const ADJECTIVES: [&str; 25] = [
    "Quick", "Lazy", "Mysterious", "Jolly", "Brave", "Silent", "Witty", "Fierce",
    "Clever", "Gentle", "Wild", "Calm", "Bold", "Shy", "Proud", "Happy", "Sad",
    "Eager", "Fancy", "Rusty", "Golden", "Silver", "Bright", "Dark", "Lucky",
];

const NOUNS: [&str; 24] = [
    "Fox", "Bear", "Eagle", "Wolf", "Dragon", "Tiger", "Lion", "Owl", "Rabbit",
    "Falcon", "Hawk", "Shark", "Panda", "Kitten", "Puppy", "Phoenix", "Griffin",
    "Unicorn", "Turtle", "Dolphin", "Whale", "Elephant", "Giraffe", "Zebra",
];

/// Display name for someone who did not pick one, e.g. "Witty Owl".
pub(crate) fn random_alias() -> String {
    let mut rng = rand::rng();
    format!(
        "{} {}",
        ADJECTIVES.choose(&mut rng).copied().unwrap_or("Quiet"),
        NOUNS.choose(&mut rng).copied().unwrap_or("Speaker"),
    )
}

/// Trims and bounds a requested display name, falling back to an alias when blank.
pub(crate) fn display_name(requested: Option<&str>) -> String {
    match requested.map(str::trim).filter(|name| !name.is_empty()) {
        Some(name) => name.chars().take(MAX_NAME_LEN).collect(),
        None => random_alias(),
    }
}
