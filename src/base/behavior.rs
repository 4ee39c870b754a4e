/// Anything advanced by a clock.
pub trait ModuleBehaviors {
    fn tick_one(&mut self);
    fn reset(&mut self);
}
