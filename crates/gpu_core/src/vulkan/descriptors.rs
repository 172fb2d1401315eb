//! Descriptor set layouts, pools and batched set writes
//!
//! Three stages: a layout declares binding shapes, a pool hands out sets
//! against a fixed budget, and a writer allocates one set and fills every
//! accumulated binding with a single update call.

use ash::vk;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::DescriptorPoolConfig;
use crate::error::{VulkanError, VulkanResult};
use crate::vulkan::device::Device;

/// Descriptors of each type consumed by one set
pub type DescriptorCounts = HashMap<vk::DescriptorType, u32>;

/// One binding slot of a layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutBinding {
    /// Descriptor type
    pub descriptor_type: vk::DescriptorType,
    /// Shader stages that read the binding
    pub stage_flags: vk::ShaderStageFlags,
    /// Array length
    pub count: u32,
}

/// Descriptor set layout builder for creating reusable layouts
#[derive(Debug, Clone, Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: BTreeMap<u32, LayoutBinding>,
}

impl DescriptorSetLayoutBuilder {
    /// Create a new descriptor set layout builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare binding `index`; a later call with the same index replaces it
    #[must_use]
    pub fn add_binding(
        mut self,
        index: u32,
        descriptor_type: vk::DescriptorType,
        stage_flags: vk::ShaderStageFlags,
        count: u32,
    ) -> Self {
        self.bindings.insert(index, LayoutBinding { descriptor_type, stage_flags, count });
        self
    }

    /// Add a uniform buffer binding
    #[must_use]
    pub fn add_uniform_buffer(self, index: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add_binding(index, vk::DescriptorType::UNIFORM_BUFFER, stage_flags, 1)
    }

    /// Add a uniform buffer bound with a dynamic offset
    #[must_use]
    pub fn add_dynamic_uniform_buffer(self, index: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add_binding(index, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, stage_flags, 1)
    }

    /// Add a storage buffer binding
    #[must_use]
    pub fn add_storage_buffer(self, index: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add_binding(index, vk::DescriptorType::STORAGE_BUFFER, stage_flags, 1)
    }

    /// Add a combined image sampler binding
    #[must_use]
    pub fn add_combined_image_sampler(self, index: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add_binding(index, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, stage_flags, 1)
    }

    /// Declared bindings keyed by index
    pub const fn bindings(&self) -> &BTreeMap<u32, LayoutBinding> {
        &self.bindings
    }

    /// Total descriptors per type that one set of this layout consumes
    pub fn descriptor_counts(&self) -> DescriptorCounts {
        let mut counts = DescriptorCounts::new();
        for binding in self.bindings.values() {
            *counts.entry(binding.descriptor_type).or_insert(0) += binding.count;
        }
        counts
    }

    /// Build the descriptor set layout
    pub fn build(self, device: &Arc<Device>) -> VulkanResult<DescriptorSetLayout> {
        let raw: Vec<vk::DescriptorSetLayoutBinding> = self
            .bindings
            .iter()
            .map(|(&index, binding)| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(index)
                    .descriptor_type(binding.descriptor_type)
                    .descriptor_count(binding.count)
                    .stage_flags(binding.stage_flags)
                    .build()
            })
            .collect();

        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&raw);
        let layout = unsafe { device.handle().create_descriptor_set_layout(&layout_info, None) }
            .map_err(VulkanError::Api)?;

        log::debug!("Created descriptor set layout with {} bindings", raw.len());
        Ok(DescriptorSetLayout {
            device: Arc::clone(device),
            layout,
            counts: self.descriptor_counts(),
            bindings: self.bindings,
        })
    }
}

/// Immutable descriptor set layout with its binding declarations
pub struct DescriptorSetLayout {
    device: Arc<Device>,
    layout: vk::DescriptorSetLayout,
    bindings: BTreeMap<u32, LayoutBinding>,
    counts: DescriptorCounts,
}

impl DescriptorSetLayout {
    /// Start a builder
    pub fn builder() -> DescriptorSetLayoutBuilder {
        DescriptorSetLayoutBuilder::new()
    }

    /// Get the Vulkan descriptor set layout handle
    pub const fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Declaration of binding `index`
    pub fn binding(&self, index: u32) -> Option<&LayoutBinding> {
        self.bindings.get(&index)
    }

    /// All bindings keyed by index
    pub const fn bindings(&self) -> &BTreeMap<u32, LayoutBinding> {
        &self.bindings
    }

    /// Descriptors per type consumed by one set
    pub const fn descriptor_counts(&self) -> &DescriptorCounts {
        &self.counts
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// Host-side accounting of a pool's set and per-type descriptor capacity
///
/// Reservation is all-or-nothing, so a refused request leaves earlier
/// reservations untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolBudget {
    max_sets: u32,
    capacity: DescriptorCounts,
    used_sets: u32,
    used: DescriptorCounts,
}

impl PoolBudget {
    /// Budget for `max_sets` sets drawing from `pool_sizes`
    pub fn new(max_sets: u32, pool_sizes: &[vk::DescriptorPoolSize]) -> Self {
        let mut capacity = DescriptorCounts::new();
        for size in pool_sizes {
            *capacity.entry(size.ty).or_insert(0) += size.descriptor_count;
        }
        Self { max_sets, capacity, used_sets: 0, used: DescriptorCounts::new() }
    }

    /// Whether one more set consuming `counts` fits
    pub fn can_reserve(&self, counts: &DescriptorCounts) -> bool {
        self.used_sets < self.max_sets
            && counts.iter().all(|(ty, &needed)| {
                let used = self.used.get(ty).copied().unwrap_or(0);
                let capacity = self.capacity.get(ty).copied().unwrap_or(0);
                used.saturating_add(needed) <= capacity
            })
    }

    /// Reserve room for one set; returns false and changes nothing when it does not fit
    pub fn reserve(&mut self, counts: &DescriptorCounts) -> bool {
        if !self.can_reserve(counts) {
            return false;
        }
        self.used_sets += 1;
        for (ty, &needed) in counts {
            *self.used.entry(*ty).or_insert(0) += needed;
        }
        true
    }

    /// Return one set's worth of descriptors
    pub fn release(&mut self, counts: &DescriptorCounts) {
        self.used_sets = self.used_sets.saturating_sub(1);
        for (ty, &freed) in counts {
            if let Some(used) = self.used.get_mut(ty) {
                *used = used.saturating_sub(freed);
            }
        }
    }

    /// Forget every reservation
    pub fn reset(&mut self) {
        self.used_sets = 0;
        self.used.clear();
    }

    /// Sets currently reserved
    pub const fn sets_in_use(&self) -> u32 {
        self.used_sets
    }

    /// Sets still available
    pub const fn remaining_sets(&self) -> u32 {
        self.max_sets - self.used_sets
    }

    /// Descriptors of `ty` currently reserved
    pub fn descriptors_in_use(&self, ty: vk::DescriptorType) -> u32 {
        self.used.get(&ty).copied().unwrap_or(0)
    }
}

/// Builder for [`DescriptorPool`]
pub struct DescriptorPoolBuilder {
    device: Arc<Device>,
    pool_sizes: Vec<vk::DescriptorPoolSize>,
    max_sets: u32,
    flags: vk::DescriptorPoolCreateFlags,
}

impl DescriptorPoolBuilder {
    /// Default `max_sets` when none is given
    pub const DEFAULT_MAX_SETS: u32 = 1000;

    /// Start a builder for `device`
    pub fn new(device: &Arc<Device>) -> Self {
        Self {
            device: Arc::clone(device),
            pool_sizes: Vec::new(),
            max_sets: Self::DEFAULT_MAX_SETS,
            flags: vk::DescriptorPoolCreateFlags::empty(),
        }
    }

    /// Reserve `count` descriptors of `ty`
    #[must_use]
    pub fn add_pool_size(mut self, ty: vk::DescriptorType, count: u32) -> Self {
        self.pool_sizes.push(vk::DescriptorPoolSize { ty, descriptor_count: count });
        self
    }

    /// Set the pool creation flags
    #[must_use]
    pub const fn set_pool_flags(mut self, flags: vk::DescriptorPoolCreateFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the maximum number of sets
    #[must_use]
    pub const fn set_max_sets(mut self, max_sets: u32) -> Self {
        self.max_sets = max_sets;
        self
    }

    /// Create the pool
    pub fn build(self) -> VulkanResult<DescriptorPool> {
        if self.pool_sizes.is_empty() {
            return Err(VulkanError::invalid("descriptor pool needs at least one pool size"));
        }
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(self.flags)
            .max_sets(self.max_sets)
            .pool_sizes(&self.pool_sizes);
        let pool = unsafe { self.device.handle().create_descriptor_pool(&pool_info, None) }
            .map_err(VulkanError::Api)?;

        log::debug!("Created descriptor pool: {} sets, {} pool sizes", self.max_sets, self.pool_sizes.len());
        Ok(DescriptorPool {
            device: self.device,
            pool,
            flags: self.flags,
            state: Mutex::new(PoolState {
                budget: PoolBudget::new(self.max_sets, &self.pool_sizes),
                live: HashMap::new(),
            }),
        })
    }
}

struct PoolState {
    budget: PoolBudget,
    live: HashMap<vk::DescriptorSet, DescriptorCounts>,
}

/// Fixed-capacity descriptor pool
pub struct DescriptorPool {
    device: Arc<Device>,
    pool: vk::DescriptorPool,
    flags: vk::DescriptorPoolCreateFlags,
    state: Mutex<PoolState>,
}

impl DescriptorPool {
    /// Start a builder
    pub fn builder(device: &Arc<Device>) -> DescriptorPoolBuilder {
        DescriptorPoolBuilder::new(device)
    }

    /// Create a pool sized from configuration
    pub fn from_config(
        device: &Arc<Device>,
        config: &DescriptorPoolConfig,
        flags: vk::DescriptorPoolCreateFlags,
    ) -> VulkanResult<Self> {
        config
            .pool_sizes
            .iter()
            .fold(DescriptorPoolBuilder::new(device), |builder, size| {
                builder.add_pool_size(size.kind.to_vk(), size.count)
            })
            .set_max_sets(config.max_sets)
            .set_pool_flags(flags)
            .build()
    }

    /// Allocate one set of `layout`
    ///
    /// Fails with [`VulkanError::PoolExhausted`] when the set count or any
    /// per-type capacity would be exceeded.
    pub fn allocate(&self, layout: &DescriptorSetLayout) -> VulkanResult<vk::DescriptorSet> {
        let mut state = self.state.lock();
        let counts = layout.descriptor_counts();
        if !state.budget.reserve(counts) {
            return Err(VulkanError::PoolExhausted);
        }

        let layouts = [layout.handle()];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);
        match unsafe { self.device.handle().allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => match sets.first() {
                Some(&set) => {
                    state.live.insert(set, counts.clone());
                    Ok(set)
                }
                None => {
                    state.budget.release(counts);
                    Err(VulkanError::invalid("driver returned no descriptor set"))
                }
            },
            Err(err) => {
                state.budget.release(counts);
                match err {
                    vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                        Err(VulkanError::PoolExhausted)
                    }
                    other => Err(VulkanError::Api(other)),
                }
            }
        }
    }

    /// Return individual sets to the pool
    ///
    /// Requires the pool to have been created with `FREE_DESCRIPTOR_SET`.
    pub fn free_descriptors(&self, sets: &[vk::DescriptorSet]) -> VulkanResult<()> {
        if !self.flags.contains(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET) {
            return Err(VulkanError::invalid("pool was not created with FREE_DESCRIPTOR_SET"));
        }
        if sets.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        unsafe { self.device.handle().free_descriptor_sets(self.pool, sets) }.map_err(VulkanError::Api)?;
        for set in sets {
            if let Some(counts) = state.live.remove(set) {
                state.budget.release(&counts);
            }
        }
        Ok(())
    }

    /// Return every set to the pool
    pub fn reset(&self) -> VulkanResult<()> {
        let mut state = self.state.lock();
        unsafe {
            self.device
                .handle()
                .reset_descriptor_pool(self.pool, vk::DescriptorPoolResetFlags::empty())
        }
        .map_err(VulkanError::Api)?;
        state.budget.reset();
        state.live.clear();
        Ok(())
    }

    /// Sets currently allocated
    pub fn sets_in_use(&self) -> u32 {
        self.state.lock().budget.sets_in_use()
    }

    /// Get the pool handle
    pub const fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_descriptor_pool(self.pool, None);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum WriteResource {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
}

#[derive(Debug, Clone, Copy)]
struct PendingWrite {
    binding: u32,
    descriptor_type: vk::DescriptorType,
    resource: WriteResource,
}

/// Accumulates binding writes for one layout, then allocates and fills a set
pub struct DescriptorWriter<'a> {
    layout: &'a DescriptorSetLayout,
    pool: &'a DescriptorPool,
    writes: Vec<PendingWrite>,
}

impl<'a> DescriptorWriter<'a> {
    /// Create a writer for sets of `layout` drawn from `pool`
    pub const fn new(layout: &'a DescriptorSetLayout, pool: &'a DescriptorPool) -> Self {
        Self { layout, pool, writes: Vec::new() }
    }

    fn push(mut self, binding: u32, resource: WriteResource) -> Self {
        match self.layout.binding(binding) {
            Some(declared) => self.writes.push(PendingWrite {
                binding,
                descriptor_type: declared.descriptor_type,
                resource,
            }),
            None => log::warn!("Layout has no binding {binding}; write skipped"),
        }
        self
    }

    /// Bind a buffer range to `binding`
    #[must_use]
    pub fn write_buffer(self, binding: u32, info: vk::DescriptorBufferInfo) -> Self {
        self.push(binding, WriteResource::Buffer(info))
    }

    /// Bind an image/sampler to `binding`
    #[must_use]
    pub fn write_image(self, binding: u32, info: vk::DescriptorImageInfo) -> Self {
        self.push(binding, WriteResource::Image(info))
    }

    /// Number of writes that will be applied
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether no writes were accumulated
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Allocate a set and apply every write to it
    ///
    /// `Ok(None)` means the pool is exhausted so the caller can grow the pool
    /// and retry; previously allocated sets are unaffected. Any other
    /// allocation failure is returned as an error.
    pub fn build(&self) -> VulkanResult<Option<vk::DescriptorSet>> {
        let set = exhaustion_as_none(self.pool.allocate(self.layout));
        match &set {
            Ok(Some(set)) => self.overwrite(*set),
            Ok(None) => log::warn!("Descriptor pool exhausted ({} sets in use)", self.pool.sets_in_use()),
            Err(err) => log::error!("Descriptor set allocation failed: {err}"),
        }
        set
    }

    /// Apply every write to an existing `set` in one update call
    pub fn overwrite(&self, set: vk::DescriptorSet) {
        let buffer_infos: Vec<vk::DescriptorBufferInfo> = self
            .writes
            .iter()
            .filter_map(|write| match write.resource {
                WriteResource::Buffer(info) => Some(info),
                WriteResource::Image(_) => None,
            })
            .collect();
        let image_infos: Vec<vk::DescriptorImageInfo> = self
            .writes
            .iter()
            .filter_map(|write| match write.resource {
                WriteResource::Image(info) => Some(info),
                WriteResource::Buffer(_) => None,
            })
            .collect();

        let (mut next_buffer, mut next_image) = (0, 0);
        let raw: Vec<vk::WriteDescriptorSet> = self
            .writes
            .iter()
            .map(|write| {
                let builder = vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(write.binding)
                    .dst_array_element(0)
                    .descriptor_type(write.descriptor_type);
                match write.resource {
                    WriteResource::Buffer(_) => {
                        next_buffer += 1;
                        builder.buffer_info(std::slice::from_ref(&buffer_infos[next_buffer - 1])).build()
                    }
                    WriteResource::Image(_) => {
                        next_image += 1;
                        builder.image_info(std::slice::from_ref(&image_infos[next_image - 1])).build()
                    }
                }
            })
            .collect();

        unsafe { self.pool.device.handle().update_descriptor_sets(&raw, &[]) };
    }
}

/// Pool exhaustion is retryable; everything else stays an error
fn exhaustion_as_none(allocated: VulkanResult<vk::DescriptorSet>) -> VulkanResult<Option<vk::DescriptorSet>> {
    match allocated {
        Ok(set) => Ok(Some(set)),
        Err(VulkanError::PoolExhausted) => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pairs: &[(vk::DescriptorType, u32)]) -> DescriptorCounts {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_layout_builder_overwrites_same_index() {
        let builder = DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .add_combined_image_sampler(1, vk::ShaderStageFlags::FRAGMENT)
            .add_storage_buffer(0, vk::ShaderStageFlags::FRAGMENT);

        assert_eq!(builder.bindings().len(), 2);
        let first = builder.bindings()[&0];
        assert_eq!(first.descriptor_type, vk::DescriptorType::STORAGE_BUFFER);
        assert_eq!(first.stage_flags, vk::ShaderStageFlags::FRAGMENT);
    }

    #[test]
    fn test_layout_descriptor_counts() {
        let builder = DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .add_binding(1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::FRAGMENT, 4)
            .add_uniform_buffer(2, vk::ShaderStageFlags::FRAGMENT);

        let counts = builder.descriptor_counts();
        assert_eq!(counts[&vk::DescriptorType::UNIFORM_BUFFER], 2);
        assert_eq!(counts[&vk::DescriptorType::COMBINED_IMAGE_SAMPLER], 4);
    }

    #[test]
    fn test_budget_refuses_third_set() {
        let sizes = [vk::DescriptorPoolSize { ty: vk::DescriptorType::UNIFORM_BUFFER, descriptor_count: 100 }];
        let mut budget = PoolBudget::new(2, &sizes);
        let per_set = counts(&[(vk::DescriptorType::UNIFORM_BUFFER, 1)]);

        assert!(budget.reserve(&per_set));
        assert!(budget.reserve(&per_set));
        let before = budget.clone();
        assert!(!budget.reserve(&per_set));
        assert_eq!(budget, before);
        assert_eq!(budget.sets_in_use(), 2);
        assert_eq!(budget.remaining_sets(), 0);
    }

    #[test]
    fn test_budget_refuses_type_overflow_atomically() {
        let sizes = [
            vk::DescriptorPoolSize { ty: vk::DescriptorType::UNIFORM_BUFFER, descriptor_count: 10 },
            vk::DescriptorPoolSize { ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER, descriptor_count: 1 },
        ];
        let mut budget = PoolBudget::new(10, &sizes);
        let greedy = counts(&[
            (vk::DescriptorType::UNIFORM_BUFFER, 3),
            (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 2),
        ]);

        assert!(!budget.reserve(&greedy));
        assert_eq!(budget.descriptors_in_use(vk::DescriptorType::UNIFORM_BUFFER), 0);
        assert_eq!(budget.sets_in_use(), 0);

        // A type the pool was never sized for cannot be reserved either.
        assert!(!budget.reserve(&counts(&[(vk::DescriptorType::STORAGE_IMAGE, 1)])));
    }

    #[test]
    fn test_budget_release_and_reset() {
        let sizes = [
            vk::DescriptorPoolSize { ty: vk::DescriptorType::STORAGE_BUFFER, descriptor_count: 2 },
            vk::DescriptorPoolSize { ty: vk::DescriptorType::STORAGE_BUFFER, descriptor_count: 2 },
        ];
        let mut budget = PoolBudget::new(8, &sizes);
        let per_set = counts(&[(vk::DescriptorType::STORAGE_BUFFER, 2)]);

        assert!(budget.reserve(&per_set));
        assert!(budget.reserve(&per_set));
        assert!(!budget.reserve(&per_set));

        budget.release(&per_set);
        assert!(budget.reserve(&per_set));

        budget.reset();
        assert_eq!(budget.sets_in_use(), 0);
        assert_eq!(budget.descriptors_in_use(vk::DescriptorType::STORAGE_BUFFER), 0);
    }

    #[test]
    fn test_only_exhaustion_is_retryable() {
        let set = vk::DescriptorSet::null();
        assert_eq!(exhaustion_as_none(Ok(set)).unwrap(), Some(set));
        assert_eq!(exhaustion_as_none(Err(VulkanError::PoolExhausted)).unwrap(), None);

        let fatal = exhaustion_as_none(Err(VulkanError::Api(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)));
        assert!(matches!(fatal, Err(VulkanError::Api(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))));
        assert!(matches!(exhaustion_as_none(Err(VulkanError::DeviceLost)), Err(VulkanError::DeviceLost)));
    }
}
