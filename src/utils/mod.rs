/// Useful enumerations for detectors, particle hypotheses and fit quantities.
pub mod enums;
/// Standard special functions like the $`\chi^2`$ survival function and breakup momenta.
pub mod functions;
/// [`Vec3`](vectors::Vec3) and [`Vec4`](vectors::Vec4), three- and four-vectors with the usual
/// kinematic operations.
pub mod vectors;

/// Join a list of names into a single comma-separated string.
pub fn list_to_name<I, S>(names: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .map(|s| s.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
