// Demo 000: an empty window

use super::Demo;
use crate::config::Config;

pub struct Nothing;

impl Nothing {
    pub fn create(_config: &Config) -> Box<dyn Demo> {
        Box::new(Nothing)
    }
}

impl Demo for Nothing {
    fn name(&self) -> &'static str {
        "Nothing"
    }

    fn renders(&self) -> bool {
        false
    }
}
