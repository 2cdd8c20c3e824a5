//! Shared parameter and velocity storage

use crate::backend::{Access, Accelerator, BoundRegion, Command, DeviceBuffer, GridSize, Scalar};
use crate::error::ForgeResult;
use crate::graph::NodeId;
use crate::layers::{kernels, ParameterId, ParameterSpec};
use crate::solver::SgdParameters;

use super::instance::Instance;

/// Parameter values shared by every instance, plus momentum history when
/// the runner trains. Gradients live in backward instances.
#[derive(Debug)]
pub struct ParameterStore {
    specs: Vec<ParameterSpec>,
    values: Vec<DeviceBuffer>,
    velocities: Vec<DeviceBuffer>,
}

impl ParameterStore {
    pub fn allocate(
        accelerator: &dyn Accelerator,
        specs: Vec<ParameterSpec>,
        label: &str,
        training: bool,
    ) -> ForgeResult<Self> {
        let mut store = ParameterStore {
            specs: Vec::with_capacity(specs.len()),
            values: Vec::with_capacity(specs.len()),
            velocities: Vec::new(),
        };

        for spec in specs {
            if let Err(e) = store.push(accelerator, spec, label, training) {
                store.free(accelerator);
                return Err(e);
            }
        }
        Ok(store)
    }

    fn push(
        &mut self,
        accelerator: &dyn Accelerator,
        spec: ParameterSpec,
        label: &str,
        training: bool,
    ) -> ForgeResult<()> {
        let value = accelerator.allocate(spec.initial.len(), &format!("{}.param:{}", label, spec.name))?;
        self.values.push(value.clone());
        accelerator.upload(&value, 0, &spec.initial)?;
        if training {
            let velocity = accelerator
                .allocate(spec.initial.len(), &format!("{}.velocity:{}", label, spec.name))?;
            self.velocities.push(velocity);
        }
        self.specs.push(spec);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn specs(&self) -> &[ParameterSpec] {
        &self.specs
    }

    /// Parameter `name` registered by `node`
    pub fn find(&self, node: NodeId, name: &str) -> Option<ParameterId> {
        self.specs
            .iter()
            .find(|s| s.node == node && s.name == name)
            .map(|s| s.id)
    }

    pub fn value(&self, id: ParameterId) -> Option<&DeviceBuffer> {
        self.values.get(id.index())
    }

    pub fn velocity(&self, id: ParameterId) -> Option<&DeviceBuffer> {
        self.velocities.get(id.index())
    }

    /// One `sgd_update` command per parameter, reading gradients from
    /// `gradients`.
    pub fn update_commands(&self, gradients: &Instance, params: SgdParameters) -> Option<Vec<Command>> {
        self.specs
            .iter()
            .map(|spec| {
                let value = self.value(spec.id)?;
                let gradient = gradients.gradient(spec.id)?;
                let velocity = self.velocity(spec.id)?;
                let len = value.len();
                let whole = |buffer: &DeviceBuffer, access| BoundRegion {
                    buffer: buffer.clone(),
                    offset: 0,
                    len,
                    access,
                };
                Some(Command {
                    kernel: kernels::SGD_UPDATE.to_string(),
                    regions: vec![
                        whole(value, Access::ReadWrite),
                        whole(gradient, Access::Read),
                        whole(velocity, Access::ReadWrite),
                    ],
                    scalars: vec![
                        Scalar::F32(params.learning_rate),
                        Scalar::F32(params.momentum),
                    ],
                    grid: GridSize::new(len, 1),
                })
            })
            .collect()
    }

    pub fn free(&mut self, accelerator: &dyn Accelerator) {
        for buffer in self.values.drain(..).chain(self.velocities.drain(..)) {
            accelerator.free(&buffer);
        }
    }
}
