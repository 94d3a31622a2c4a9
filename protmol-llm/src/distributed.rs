//! Process coordination for multi-GPU training.
//!
//! The trainer only talks to the [`Fabric`] trait. [`LocalFabric`] runs a
//! single process; [`NcclFabric`] (feature `nccl`) averages gradients across
//! one process per GPU with NCCL.

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use candle_nn::VarMap;

use crate::data::DataLoader;

/// Distributed configuration for multi-GPU training
#[derive(Debug, Clone)]
pub struct DistributedConfig {
    /// Total number of GPUs/processes
    pub world_size: usize,
    /// This process's rank (0 to world_size-1)
    pub rank: usize,
    /// Path to communication file for NCCL ID exchange
    pub comm_file: String,
}

impl DistributedConfig {
    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }
}

/// This rank's slice of `indices`.
///
/// The list is first padded by wrapping around so it divides evenly, then rank
/// `r` takes every `world_size`-th index starting at `r`. Every rank ends up
/// with the same number of samples and therefore the same number of batches.
pub fn shard_indices(indices: &[usize], rank: usize, world_size: usize) -> Vec<usize> {
    if world_size <= 1 || indices.is_empty() {
        return indices.to_vec();
    }
    let per_rank = indices.len().div_ceil(world_size);
    let total = per_rank * world_size;
    (rank..total)
        .step_by(world_size)
        .map(|i| indices[i % indices.len()])
        .collect()
}

/// What the trainer needs from the process group.
pub trait Fabric {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn device(&self) -> &Device;

    fn is_main_process(&self) -> bool {
        self.rank() == 0
    }

    /// Makes every replica start from the same parameters.
    fn setup(&self, var_map: &VarMap) -> Result<()>;

    /// Restricts a loader to this rank's shard.
    fn setup_loader(&self, loader: DataLoader) -> DataLoader {
        let shard = shard_indices(loader.indices(), self.rank(), self.world_size());
        loader.with_indices(shard)
    }

    fn to_device(&self, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor.to_device(self.device())?)
    }

    /// Gradients of `loss` for `vars`, averaged across ranks.
    fn backward(&self, loss: &Tensor, vars: &[Var]) -> Result<GradStore>;

    /// Element-wise sum of `values` across ranks.
    fn all_reduce_sum(&self, values: &[f64]) -> Result<Vec<f64>>;

    fn barrier(&self) -> Result<()>;
}

/// Single-process fabric.
#[derive(Debug, Clone)]
pub struct LocalFabric {
    device: Device,
}

impl LocalFabric {
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    pub fn cpu() -> Self {
        Self::new(Device::Cpu)
    }
}

impl Fabric for LocalFabric {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn setup(&self, _var_map: &VarMap) -> Result<()> {
        Ok(())
    }

    fn backward(&self, loss: &Tensor, _vars: &[Var]) -> Result<GradStore> {
        Ok(loss.backward()?)
    }

    fn all_reduce_sum(&self, values: &[f64]) -> Result<Vec<f64>> {
        Ok(values.to_vec())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(feature = "nccl")]
pub use nccl::{NcclCommunicator, NcclFabric};

#[cfg(feature = "nccl")]
mod nccl {
    use anyhow::{Result, anyhow};
    use candle_core::backprop::GradStore;
    use candle_core::{Device, Tensor, Var};
    use candle_nn::VarMap;
    use cudarc::driver::safe::{CudaContext, CudaStream, DeviceRepr, ValidAsZeroBits};
    use cudarc::nccl::safe::{Comm, Id, NcclType, ReduceOp};
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use super::{DistributedConfig, Fabric};

    /// NCCL communicator on this rank's CUDA stream.
    pub struct NcclCommunicator {
        comm: Comm,
        stream: Arc<CudaStream>,
        rank: usize,
        world_size: usize,
    }

    impl NcclCommunicator {
        /// Rank 0 creates the NCCL unique id and publishes it through
        /// `comm_file`; the other ranks poll for the file.
        pub fn new(config: &DistributedConfig) -> Result<Self> {
            let comm_file = PathBuf::from(&config.comm_file);
            let id = if config.rank == 0 {
                publish_id(&comm_file)?
            } else {
                await_id(&comm_file, config.rank)?
            };

            // With CUDA_VISIBLE_DEVICES set per process the visible GPU is ordinal 0
            let ctx = CudaContext::new(0)
                .map_err(|e| anyhow!("Failed to create CUDA context: {:?}", e))?;
            let stream = ctx.default_stream();
            let comm = Comm::from_rank(stream.clone(), config.rank, config.world_size, id)
                .map_err(|e| anyhow!("Failed to create NCCL communicator: {:?}", e.0))?;

            if config.rank == 0 {
                std::thread::sleep(Duration::from_secs(2));
                let _ = std::fs::remove_file(&comm_file);
            }

            tracing::info!(rank = config.rank, "NCCL communicator initialized");
            Ok(Self {
                comm,
                stream,
                rank: config.rank,
                world_size: config.world_size,
            })
        }

        /// Element-wise sum of `data` across ranks.
        fn sum<T>(&self, data: &[T]) -> Result<Vec<T>>
        where
            T: NcclType + DeviceRepr + ValidAsZeroBits + Clone + Default,
        {
            let send = self
                .stream
                .clone_htod(data)
                .map_err(|e| anyhow!("Failed to copy data to GPU: {:?}", e))?;
            let mut recv = self
                .stream
                .alloc_zeros::<T>(data.len())
                .map_err(|e| anyhow!("Failed to allocate GPU buffer: {:?}", e))?;
            self.comm
                .all_reduce(&send, &mut recv, &ReduceOp::Sum)
                .map_err(|e| anyhow!("NCCL all-reduce failed: {:?}", e.0))?;
            self.stream
                .clone_dtoh(&recv)
                .map_err(|e| anyhow!("Failed to copy data from GPU: {:?}", e))
        }

        /// Mean of `tensor` across ranks.
        pub fn all_reduce_avg(&self, tensor: &Tensor) -> Result<Tensor> {
            let data: Vec<f32> = tensor.flatten_all()?.to_dtype(candle_core::DType::F32)?.to_vec1()?;
            let summed = self.sum(&data)?;
            let avg = Tensor::from_vec(summed, tensor.shape(), tensor.device())?
                .affine(1.0 / self.world_size as f64, 0.0)?
                .to_dtype(tensor.dtype())?;
            Ok(avg)
        }

        /// Rank 0's copy of `tensor`.
        pub fn broadcast(&self, tensor: &Tensor) -> Result<Tensor> {
            let data: Vec<f32> = tensor.flatten_all()?.to_dtype(candle_core::DType::F32)?.to_vec1()?;
            let send = if self.rank == 0 {
                Some(
                    self.stream
                        .clone_htod(&data)
                        .map_err(|e| anyhow!("Failed to copy data to GPU: {:?}", e))?,
                )
            } else {
                None
            };
            let mut recv = self
                .stream
                .alloc_zeros::<f32>(data.len())
                .map_err(|e| anyhow!("Failed to allocate GPU buffer: {:?}", e))?;
            self.comm
                .broadcast(send.as_ref(), &mut recv, 0)
                .map_err(|e| anyhow!("NCCL broadcast failed: {:?}", e.0))?;
            let output = self
                .stream
                .clone_dtoh(&recv)
                .map_err(|e| anyhow!("Failed to copy data from GPU: {:?}", e))?;
            Ok(Tensor::from_vec(output, tensor.shape(), tensor.device())?.to_dtype(tensor.dtype())?)
        }

        pub fn barrier(&self) -> Result<()> {
            self.sum(&[0.0f32])?;
            Ok(())
        }

        pub fn rank(&self) -> usize {
            self.rank
        }

        pub fn world_size(&self) -> usize {
            self.world_size
        }
    }

    fn publish_id(comm_file: &PathBuf) -> Result<Id> {
        use std::io::Write;

        if comm_file.exists() {
            std::fs::remove_file(comm_file)?;
        }
        let id = Id::new().map_err(|e| anyhow!("Failed to create NCCL ID: {:?}", e))?;

        // write then rename so readers never see a partial file
        let tmp_file = comm_file.with_extension("tmp");
        let mut file = std::fs::File::create(&tmp_file)?;
        file.write_all(&id.internal().iter().map(|&i| i as u8).collect::<Vec<_>>())?;
        std::fs::rename(&tmp_file, comm_file)?;
        tracing::info!(rank = 0, path = ?comm_file, "Published NCCL ID");
        Ok(id)
    }

    fn await_id(comm_file: &PathBuf, rank: usize) -> Result<Id> {
        tracing::info!(rank, path = ?comm_file, "Waiting for NCCL ID");
        while !comm_file.exists() {
            std::thread::sleep(Duration::from_millis(100));
        }
        let internal: [i8; 128] = std::fs::read(comm_file)?
            .into_iter()
            .map(|i| i as i8)
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow!("Invalid NCCL ID file"))?;
        Ok(Id::uninit(internal))
    }

    /// One process per GPU, gradients averaged with NCCL all-reduce.
    pub struct NcclFabric {
        comm: NcclCommunicator,
        device: Device,
    }

    impl NcclFabric {
        pub fn launch(config: &DistributedConfig, device: Device) -> Result<Self> {
            let comm = NcclCommunicator::new(config)?;
            Ok(Self { comm, device })
        }
    }

    impl Fabric for NcclFabric {
        fn rank(&self) -> usize {
            self.comm.rank()
        }

        fn world_size(&self) -> usize {
            self.comm.world_size()
        }

        fn device(&self) -> &Device {
            &self.device
        }

        fn setup(&self, var_map: &VarMap) -> Result<()> {
            for var in var_map.all_vars() {
                let synced = self.comm.broadcast(var.as_tensor())?;
                var.set(&synced)?;
            }
            Ok(())
        }

        fn backward(&self, loss: &Tensor, vars: &[Var]) -> Result<GradStore> {
            let mut grads = loss.backward()?;
            // every rank reduces every var in the same order, even without a local gradient
            for var in vars {
                let local = match grads.get(var.as_tensor()) {
                    Some(grad) => grad.clone(),
                    None => var.as_tensor().zeros_like()?,
                };
                let averaged = self.comm.all_reduce_avg(&local)?;
                grads.insert(var.as_tensor(), averaged);
            }
            Ok(grads)
        }

        fn all_reduce_sum(&self, values: &[f64]) -> Result<Vec<f64>> {
            self.comm.sum(values)
        }

        fn barrier(&self) -> Result<()> {
            self.comm.barrier()
        }
    }

}
