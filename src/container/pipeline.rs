//! Chain-of-responsibility dispatch.
//!
//! ```text
//!  handle ──> [ valve 1 ] ──> [ valve 2 ] ──> ... ──> [ basic ]
//! ```
//!
//! Added valves keep their insertion order and always run before the basic
//! (tail) valve. A valve that does not call [`Next::invoke`] ends the chain.

use crate::http::action::Exchange;
use anyhow::anyhow;
use std::sync::Arc;
use tracing::debug;

/// One stage of a [`Pipeline`].
pub trait Valve: Send + Sync {
    fn invoke(&self, exchange: &mut Exchange<'_>, next: Next<'_>) -> anyhow::Result<()>;

    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Stage(usize),
    Basic,
    End,
}

struct Stage {
    valve: Arc<dyn Valve>,
    next: Link,
}

/// Ordered valves ending in a fixed basic valve.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
    first: Option<usize>,
    basic: Option<Arc<dyn Valve>>,
}

impl Pipeline {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs or replaces the tail. Valves that pointed at the old tail now
    /// point at the new one.
    pub fn set_basic(&mut self, valve: Arc<dyn Valve>) -> &mut Self {
        if let Some(old) = self.basic.replace(valve) {
            debug!(old = old.name(), "replacing basic valve");
        }
        for stage in &mut self.stages {
            if stage.next == Link::End {
                stage.next = Link::Basic;
            }
        }
        self
    }

    /// Splices `valve` in right before the basic valve.
    pub fn add_valve(&mut self, valve: Arc<dyn Valve>) -> &mut Self {
        let index = self.stages.len();
        let tail = match self.basic {
            Some(_) => Link::Basic,
            None => Link::End,
        };
        self.stages.push(Stage { valve, next: tail });

        match self.last_stage() {
            Some(last) => self.stages[last].next = Link::Stage(index),
            None => self.first = Some(index),
        }
        self
    }

    /// Stage currently linking to the tail, not counting the one just pushed.
    fn last_stage(&self) -> Option<usize> {
        let mut current = self.first?;
        loop {
            match self.stages[current].next {
                Link::Stage(next) => current = next,
                Link::Basic | Link::End => return Some(current),
            }
        }
    }

    pub fn basic(&self) -> Option<&Arc<dyn Valve>> {
        self.basic.as_ref()
    }

    /// Valves in invocation order, the basic valve last.
    pub fn valves(&self) -> Vec<Arc<dyn Valve>> {
        let mut valves = Vec::with_capacity(self.stages.len() + 1);
        let mut link = self.head();
        while let Link::Stage(index) = link {
            valves.push(self.stages[index].valve.clone());
            link = self.stages[index].next;
        }
        valves.extend(self.basic.clone());
        valves
    }

    fn head(&self) -> Link {
        match (self.first, &self.basic) {
            (Some(first), _) => Link::Stage(first),
            (None, Some(_)) => Link::Basic,
            (None, None) => Link::End,
        }
    }

    /// Runs the chain from its head.
    ///
    /// # Errors
    ///
    /// Whatever a valve returns, or an error when no basic valve is set.
    pub fn handle(&self, exchange: &mut Exchange<'_>) -> anyhow::Result<()> {
        if self.basic.is_none() {
            return Err(anyhow!("pipeline has no basic valve"));
        }
        Next {
            pipeline: self,
            link: self.head(),
        }
        .invoke(exchange)
    }
}

/// The rest of the chain after the current valve.
pub struct Next<'p> {
    pipeline: &'p Pipeline,
    link: Link,
}

impl Next<'_> {
    pub fn invoke(self, exchange: &mut Exchange<'_>) -> anyhow::Result<()> {
        match self.link {
            Link::Stage(index) => {
                let stage = &self.pipeline.stages[index];
                let next = Next {
                    pipeline: self.pipeline,
                    link: stage.next,
                };
                stage.valve.invoke(exchange, next)
            }
            Link::Basic => match &self.pipeline.basic {
                Some(basic) => basic.invoke(
                    exchange,
                    Next {
                        pipeline: self.pipeline,
                        link: Link::End,
                    },
                ),
                None => Err(anyhow!("pipeline has no basic valve")),
            },
            Link::End => Ok(()),
        }
    }
}
