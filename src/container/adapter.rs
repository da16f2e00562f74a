use crate::{
    container::pipeline::Pipeline,
    http::action::{Adapter, Exchange},
};

/// Hands each request to a [`Pipeline`] and finishes the response afterwards.
pub struct PipelineAdapter {
    pipeline: Pipeline,
}

impl PipelineAdapter {
    #[inline]
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    #[inline]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }
}

impl Adapter for PipelineAdapter {
    fn service(&self, exchange: &mut Exchange<'_>) -> anyhow::Result<()> {
        self.pipeline.handle(exchange)?;
        exchange.close()?;
        Ok(())
    }
}
