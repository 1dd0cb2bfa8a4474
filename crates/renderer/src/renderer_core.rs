//! Listener half of the renderer.
//!
//! `RendererCore` owns the device, the framebuffer images and the queues, and implements
//! `HazardListener`. Callbacks only append to `commands`; the public entry points on
//! `Renderer` hand them to the device once the atlas call returns.

use atlas::HazardListener;
use gpu_runtime::{
    Access, Barrier, BlitInfo, BlockRect, BufferHandle, Command, ComputeDispatch,
    ComputeProgram, DrawCall, GpuDevice, GpuError, HdSampling, ImageHandle, LoadOp, PipelineStages,
    PrimitiveVertex, RasterProgram, RenderPassDesc, ResolvePush, UNTEXTURED,
};
use smallvec::SmallVec;
use tracing::{debug, trace};
use vram_model::{
    BLOCK_HEIGHT, BLOCK_WIDTH, Domain, FbColor, Rect, StatusFlags, fbcolor_to_rgba8,
    fbcolor_to_rgba32f,
};

use crate::queue::{
    ClearCandidate, PrimitiveQueue, RenderQueue, group_by_scissor, semi_transparent_batches,
};
use crate::state::{Counters, RenderState, bump};

pub(crate) const RESOLVES_PER_DISPATCH: usize = 1024;
pub(crate) const BLITS_PER_DISPATCH: usize = 512;

/// Depth step between consecutive primitives of one pass.
const DEPTH_STEP: f32 = 4.0 / 0xff_ffff as f32;

const GRAPHICS_STAGES: PipelineStages = PipelineStages::FRAGMENT_SHADER
    .union(PipelineStages::COLOR_ATTACHMENT_OUTPUT)
    .union(PipelineStages::EARLY_FRAGMENT_TESTS);

const ALL_READ_WRITE: Access = Access::SHADER_READ
    .union(Access::SHADER_WRITE)
    .union(Access::TRANSFER_READ)
    .union(Access::TRANSFER_WRITE);

pub(crate) struct RendererCore<D: GpuDevice> {
    pub(crate) device: D,
    pub(crate) scaling: u32,
    pub(crate) scaled_levels: u32,
    /// Scaled framebuffer, RGBA8 with the mask bit in alpha, `scaled_levels` levels.
    pub(crate) scaled: ImageHandle,
    /// Native framebuffer, one VRAM word per texel.
    pub(crate) unscaled: ImageHandle,
    /// Per-pixel smoothing weight for adaptive scanout.
    pub(crate) bias: ImageHandle,
    pub(crate) scanout: Option<ImageHandle>,
    pub(crate) last_scanout: Option<ImageHandle>,
    pub(crate) state: RenderState,
    pub(crate) queue: RenderQueue,
    pub(crate) counters: Counters,
    pub(crate) primitive_index: u32,
    pub(crate) commands: Vec<Command>,
    /// Upload buffers released after the next submit.
    pub(crate) retired_buffers: Vec<BufferHandle>,
    /// Replacement sampled by textured primitives queued from now on.
    pub(crate) hd_texture: Option<HdSampling>,
    /// Replacement images released once no queued primitive samples them.
    pub(crate) retired_images: Vec<ImageHandle>,
}

impl<D: GpuDevice> RendererCore<D> {
    pub(crate) fn record(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub(crate) fn barrier(&mut self, barrier: Barrier) {
        self.record(Command::Barrier(barrier));
    }

    pub(crate) fn compute_barrier(&mut self) {
        self.barrier(Barrier {
            src_stages: PipelineStages::COMPUTE,
            src_access: Access::SHADER_WRITE,
            dst_stages: PipelineStages::COMPUTE,
            dst_access: Access::SHADER_READ | Access::SHADER_WRITE,
        });
    }

    pub(crate) fn dispatch(
        &mut self,
        program: ComputeProgram,
        images: &[ImageHandle],
        buffer: Option<BufferHandle>,
        push: &impl bytemuck::Pod,
        storage: Vec<u8>,
        groups: [u32; 3],
    ) {
        self.record(Command::Dispatch(ComputeDispatch {
            program,
            images: SmallVec::from_slice(images),
            buffer,
            push: bytemuck::bytes_of(push).to_vec(),
            storage,
            groups,
        }));
    }

    /// Hands every pending command to the device.
    pub(crate) fn commit(&mut self) -> Result<(), GpuError> {
        for command in self.commands.drain(..) {
            self.device.record(command)?;
        }
        Ok(())
    }

    /// Commits, executes and waits, then releases retired upload buffers and every
    /// retired image nothing queued or bound still samples.
    pub(crate) fn submit(&mut self) -> Result<(), GpuError> {
        self.commit()?;
        self.device.submit()?;
        for buffer in self.retired_buffers.drain(..) {
            self.device.release_buffer(buffer)?;
        }
        let (in_use, released): (Vec<ImageHandle>, Vec<ImageHandle>) =
            self.retired_images.drain(..).partition(|image| {
                self.hd_texture.is_some_and(|bound| bound.image == *image)
                    || self.queue.hd_textures.iter().any(|hd| hd.image == *image)
            });
        self.retired_images = in_use;
        for image in released {
            trace!("[renderer] release replacement image {:?}", image);
            self.device.release_image(image)?;
        }
        Ok(())
    }

    /// Depth token of the next primitive. Strictly decreasing within one pass.
    pub(crate) fn next_depth(&mut self) -> f32 {
        self.primitive_index = self
            .primitive_index
            .checked_add(1)
            .expect("primitive index overflow");
        1.0 - self.primitive_index as f32 * DEPTH_STEP
    }

    pub(crate) fn reset_queue(&mut self) {
        self.queue.clear_primitives();
        self.primitive_index = 0;
        self.reset_scissor_queue();
    }

    pub(crate) fn reset_scissor_queue(&mut self) {
        self.queue.scissors.clear();
        self.queue
            .scissors
            .push(self.state.draw_rect.scaled(self.scaling));
    }

    pub(crate) fn flush_resolves(&mut self) {
        let scaled = std::mem::take(&mut self.queue.scaled_resolves);
        let unscaled = std::mem::take(&mut self.queue.unscaled_resolves);
        if scaled.is_empty() && unscaled.is_empty() {
            return;
        }
        trace!(
            "[renderer] flush resolves scaled={} unscaled={}",
            scaled.len(),
            unscaled.len()
        );
        let push = ResolvePush::new(self.scaling);
        let s = self.scaling;
        for chunk in scaled.chunks(RESOLVES_PER_DISPATCH) {
            self.dispatch(
                ComputeProgram::ResolveToScaled,
                &[self.scaled, self.unscaled],
                None,
                &push,
                bytemuck::cast_slice::<BlockRect, u8>(chunk).to_vec(),
                [s, s, chunk.len() as u32],
            );
        }
        for chunk in unscaled.chunks(RESOLVES_PER_DISPATCH) {
            self.dispatch(
                ComputeProgram::ResolveToUnscaled,
                &[self.unscaled, self.scaled],
                None,
                &push,
                bytemuck::cast_slice::<BlockRect, u8>(chunk).to_vec(),
                [1, 1, chunk.len() as u32],
            );
        }
    }

    pub(crate) fn flush_blits(&mut self) {
        let queues = [
            (true, false, std::mem::take(&mut self.queue.scaled_blits)),
            (true, true, std::mem::take(&mut self.queue.scaled_masked_blits)),
            (false, false, std::mem::take(&mut self.queue.unscaled_blits)),
            (false, true, std::mem::take(&mut self.queue.unscaled_masked_blits)),
        ];
        let push = ResolvePush::new(self.scaling);
        for (scaled, masked, blits) in queues {
            let (target, size) = if scaled {
                (self.scaled, self.scaling)
            } else {
                (self.unscaled, 1)
            };
            for chunk in blits.chunks(BLITS_PER_DISPATCH) {
                self.dispatch(
                    ComputeProgram::BlitVram { scaled, masked },
                    &[target],
                    None,
                    &push,
                    bytemuck::cast_slice::<BlitInfo, u8>(chunk).to_vec(),
                    [size, size, chunk.len() as u32],
                );
            }
        }
    }

    fn scissor_rect(&self, scissor: Option<u32>, area: Rect) -> Rect {
        match scissor {
            None => area,
            Some(index) => self
                .queue
                .scissors
                .get(index as usize)
                .map_or(area, |rect| rect.scissor(&area)),
        }
    }

    fn draw(
        &mut self,
        program: RasterProgram,
        scissor: Rect,
        vertices: Vec<PrimitiveVertex>,
        hd: Option<u32>,
    ) {
        if scissor.is_empty() || vertices.is_empty() {
            return;
        }
        let hd = hd.and_then(|index| self.queue.hd_textures.get(index as usize).copied());
        bump(&mut self.counters.draw_calls, 1);
        bump(&mut self.counters.vertices, vertices.len() as u64);
        if hd.is_some() {
            bump(&mut self.counters.hd_draw_calls, 1);
        }
        self.record(Command::Draw(DrawCall {
            program,
            scissor,
            vertices,
            hd,
        }));
    }

    fn render_queue(&mut self, program: RasterProgram, queue: &PrimitiveQueue, area: Rect) {
        for run in group_by_scissor(queue) {
            let scissor = self.scissor_rect(run.scissor, area);
            self.draw(program, scissor, run.vertices, run.hd);
        }
    }

    /// Blended and mask-tested triangles in submission order.
    fn render_semi_transparent(&mut self, area: Rect) {
        let vertices = std::mem::take(&mut self.queue.semi_transparent);
        for (state, range) in semi_transparent_batches(&self.queue.semi_transparent_state) {
            let program = if state.masked {
                self.record(Command::PixelBarrier);
                RasterProgram::Feedback {
                    textured: state.textured,
                    mode: state.mode,
                }
            } else {
                RasterProgram::SemiTransparent {
                    textured: state.textured,
                    mode: state.mode,
                }
            };
            let scissor = self.scissor_rect(state.scissor, area);
            let batch = vertices[range.start * 3..range.end * 3].to_vec();
            self.draw(program, scissor, batch, state.hd);
        }
    }

    fn record_render_pass(&mut self, rect: Rect) {
        if !self.queue.has_primitives() {
            trace!("[renderer] render pass {:?} has no primitives", rect);
        }
        let area = rect.scaled(self.scaling);
        let pixels = area.area();
        let load = match self.queue.clear_candidate_for(rect) {
            Some(candidate) => LoadOp::Clear {
                color: fbcolor_to_rgba32f(candidate.color),
                depth: candidate.z,
            },
            None => {
                bump(&mut self.counters.fragment_readback_pixels, pixels);
                LoadOp::Load
            }
        };
        bump(&mut self.counters.fragment_writeout_pixels, pixels);
        bump(&mut self.counters.render_passes, 1);
        debug!(
            "[renderer] render pass {:?} load={:?} draws_before={}",
            rect, load, self.counters.draw_calls
        );

        self.record(Command::BeginRenderPass(RenderPassDesc {
            target: self.scaled,
            vram: self.unscaled,
            area,
            load,
        }));
        let opaque = std::mem::take(&mut self.queue.opaque);
        let opaque_textured = std::mem::take(&mut self.queue.opaque_textured);
        let semi_transparent_opaque = std::mem::take(&mut self.queue.semi_transparent_opaque);
        self.render_queue(RasterProgram::Flat, &opaque, area);
        self.render_queue(RasterProgram::Textured, &opaque_textured, area);
        self.render_queue(RasterProgram::TexturedOpaqueTexels, &semi_transparent_opaque, area);
        self.render_semi_transparent(area);
        self.record(Command::EndRenderPass);
        self.barrier(Barrier {
            src_stages: GRAPHICS_STAGES,
            src_access: Access::COLOR_ATTACHMENT_WRITE,
            dst_stages: GRAPHICS_STAGES,
            dst_access: Access::COLOR_ATTACHMENT_READ
                | Access::COLOR_ATTACHMENT_WRITE
                | Access::INPUT_ATTACHMENT_READ
                | Access::SHADER_READ,
        });

        self.reset_queue();
    }
}

fn clear_vertex(x: u32, y: u32, z: f32, color: u32) -> PrimitiveVertex {
    PrimitiveVertex {
        x: x as f32,
        y: y as f32,
        z,
        w: 1.0,
        color,
        window: [0xff, 0xff, 0, 0],
        params: UNTEXTURED,
        ..PrimitiveVertex::default()
    }
}

/// Barrier covering every access in `flags`.
pub(crate) fn hazard_barrier(flags: StatusFlags) -> Barrier {
    let mut barrier = Barrier {
        dst_stages: PipelineStages::COMPUTE | PipelineStages::TRANSFER,
        ..Barrier::default()
    };

    if flags.intersects(StatusFlags::FRAGMENT_READ | StatusFlags::FRAGMENT_WRITE) {
        barrier.src_stages |= GRAPHICS_STAGES;
    }
    if flags.intersects(StatusFlags::FRAGMENT_WRITE) {
        barrier.src_access |= Access::COLOR_ATTACHMENT_WRITE;
        barrier.dst_access |= ALL_READ_WRITE;
    }

    if flags.intersects(StatusFlags::COMPUTE_READ | StatusFlags::COMPUTE_WRITE) {
        barrier.src_stages |= PipelineStages::COMPUTE;
    }
    if flags.intersects(StatusFlags::COMPUTE_WRITE) {
        barrier.src_access |= Access::SHADER_WRITE;
        barrier.dst_access |= ALL_READ_WRITE;
    }

    if flags.intersects(StatusFlags::TRANSFER_READ | StatusFlags::TRANSFER_WRITE) {
        barrier.src_stages |= PipelineStages::TRANSFER;
    }
    if flags.intersects(StatusFlags::TRANSFER_WRITE) {
        barrier.src_access |= Access::TRANSFER_WRITE;
        barrier.dst_access |= ALL_READ_WRITE;
    }

    // Scaled writes feed later render passes.
    if flags.intersects(StatusFlags::SFB_WRITE) {
        barrier.dst_stages |= PipelineStages::FRAGMENT_SHADER | PipelineStages::COLOR_ATTACHMENT_OUTPUT;
        barrier.dst_access |= Access::COLOR_ATTACHMENT_READ
            | Access::COLOR_ATTACHMENT_WRITE
            | Access::INPUT_ATTACHMENT_READ;
    }
    // Unscaled writes feed texture sampling.
    if flags.intersects(StatusFlags::COMPUTE_FB_WRITE | StatusFlags::TRANSFER_FB_WRITE) {
        barrier.dst_stages |= PipelineStages::FRAGMENT_SHADER;
        barrier.dst_access |= Access::SHADER_READ;
    }
    barrier
}

impl<D: GpuDevice> HazardListener for RendererCore<D> {
    fn hazard(&mut self, flags: StatusFlags) {
        if flags.intersects(StatusFlags::COMPUTE_READ | StatusFlags::COMPUTE_WRITE) {
            self.flush_blits();
            self.flush_resolves();
        }
        self.barrier(hazard_barrier(flags));
    }

    fn resolve(&mut self, target: Domain, x: u32, y: u32) {
        let block = BlockRect::from(Rect::new(x, y, BLOCK_WIDTH, BLOCK_HEIGHT));
        match target {
            Domain::Scaled => self.queue.scaled_resolves.push(block),
            Domain::Unscaled => self.queue.unscaled_resolves.push(block),
        }
    }

    fn flush_render_pass(&mut self, rect: Rect) {
        self.record_render_pass(rect);
    }

    fn discard_render_pass(&mut self) {
        trace!("[renderer] discard render pass");
        self.reset_queue();
    }

    fn clear_quad(&mut self, rect: Rect, color: FbColor, clear_candidate: bool) {
        self.last_scanout = None;
        let z = self.next_depth();
        let rgba = fbcolor_to_rgba8(color);
        let corners = [
            clear_vertex(rect.x, rect.y, z, rgba),
            clear_vertex(rect.right(), rect.y, z, rgba),
            clear_vertex(rect.x, rect.bottom(), z, rgba),
            clear_vertex(rect.right(), rect.bottom(), z, rgba),
        ];
        let triangles = [0, 1, 2, 3, 2, 1].map(|index| corners[index]);
        self.queue.opaque.push_triangles(&triangles, None, None);
        if clear_candidate {
            self.queue.clear_candidates.push(ClearCandidate { rect, color, z });
        }
    }

    fn set_scissored_invariant(&mut self, invariant: bool) {
        self.queue.scissor_invariant = invariant;
    }
}
