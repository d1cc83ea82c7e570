#[cfg(test)]
mod contention_tests;
#[cfg(test)]
mod eviction_tests;
#[cfg(test)]
mod harness;
#[cfg(test)]
mod sharing_tests;
