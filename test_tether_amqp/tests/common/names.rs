/// Generates a random 6-character token to use as a globally unique name or
/// value.
pub fn random_token() -> String {
    use rand::Rng;

    rand::rng()
        .sample_iter(&rand::distr::Alphanumeric)
        .take(6)
        .map(char::from)
        .collect()
}

/// Adds a randomized suffix to the given name to make it unique.
pub fn mangle(name: &str) -> String {
    format!("{}.{}", name, random_token())
}
