use rand::{distributions::Alphanumeric, seq::SliceRandom, Rng};

const WORDS: &[&str] = &[
    "amber", "basalt", "cedar", "delta", "ember", "fjord", "granite", "harbor", "iris", "juniper",
    "kestrel", "lagoon", "meadow", "nebula", "onyx", "pine", "quartz", "raven", "sierra", "tundra",
];

fn token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// A random lowercase resource name: `{prefix}-{word}-{suffix}`.
pub fn resource_name(prefix: &str) -> String {
    let word = WORDS.choose(&mut rand::thread_rng()).copied().unwrap_or("node");
    format!("{prefix}-{word}-{}", token(6).to_lowercase())
}

/// Generate a random 16-character password.
pub fn password() -> String {
    token(16)
}

pub fn email(name: &str) -> String {
    format!("{name}@{}.example", token(5).to_lowercase())
}

pub fn description() -> String {
    let mut rng = rand::thread_rng();
    let words: Vec<&str> = WORDS.choose_multiple(&mut rng, 4).copied().collect();
    words.join(" ")
}
