#[cfg(test)]
mod chain_tests;
#[cfg(test)]
mod common;
#[cfg(test)]
mod hardware_tests;
#[cfg(test)]
mod lifecycle_tests;
#[cfg(test)]
mod ui_tests;
