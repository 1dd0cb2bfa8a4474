use crate::command::{Command, ImageDesc, ImageFormat};
use crate::error::GpuError;
use crate::key::{BufferHandle, ImageHandle};

/// Resource queries needed to check a command before it is recorded.
pub(crate) trait ResourceLookup {
    fn lookup_image(&self, image: ImageHandle) -> Result<ImageDesc, GpuError>;
    fn lookup_buffer_size(&self, buffer: BufferHandle) -> Result<u64, GpuError>;
}

/// Checks `command` against live resources and the render pass nesting. Returns
/// whether a render pass is open after the command.
pub(crate) fn validate(
    lookup: &impl ResourceLookup,
    pass_open: bool,
    command: &Command,
) -> Result<bool, GpuError> {
    if pass_open
        && !matches!(
            command,
            Command::Draw(_)
                | Command::PixelBarrier
                | Command::EndRenderPass
                | Command::BeginRenderPass(_)
        )
    {
        return Err(GpuError::InvalidCommand(
            "only draws and pixel barriers may be recorded inside a render pass".to_owned(),
        ));
    }
    match command {
        Command::Barrier(_) => {}
        Command::ClearImage { image, .. } => {
            lookup.lookup_image(*image)?;
        }
        Command::Dispatch(dispatch) => {
            if dispatch.images.len() != dispatch.program.image_count() {
                return Err(GpuError::InvalidCommand(format!(
                    "{:?} binds {} images, expected {}",
                    dispatch.program,
                    dispatch.images.len(),
                    dispatch.program.image_count()
                )));
            }
            for (index, image) in dispatch.images.iter().enumerate() {
                lookup.lookup_image(*image)?;
                if dispatch.images[..index].contains(image) {
                    return Err(GpuError::InvalidCommand(format!(
                        "{:?} binds the same image twice",
                        dispatch.program
                    )));
                }
            }
            match (dispatch.program.needs_buffer(), dispatch.buffer) {
                (true, Some(buffer)) => {
                    lookup.lookup_buffer_size(buffer)?;
                }
                (true, None) => {
                    return Err(GpuError::InvalidCommand(format!(
                        "{:?} needs an upload buffer",
                        dispatch.program
                    )));
                }
                (false, _) => {}
            }
        }
        Command::CopyImageToBuffer {
            image,
            level,
            region,
            buffer,
        }
        | Command::CopyBufferToImage {
            buffer,
            image,
            level,
            region,
        } => {
            let desc = lookup.lookup_image(*image)?;
            let size = lookup.lookup_buffer_size(*buffer)?;
            let (width, height) = desc.level_extent(*level);
            if *level >= desc.levels || region.right() > width || region.bottom() > height {
                return Err(GpuError::OutOfBounds { what: "copy region" });
            }
            if region.area() * 4 > size {
                return Err(GpuError::OutOfBounds { what: "copy buffer" });
            }
        }
        Command::BeginRenderPass(desc) => {
            if pass_open {
                return Err(GpuError::InvalidCommand(
                    "render pass begun inside a render pass".to_owned(),
                ));
            }
            lookup.lookup_image(desc.target)?;
            lookup.lookup_image(desc.vram)?;
            return Ok(true);
        }
        Command::Draw(_) | Command::PixelBarrier if !pass_open => {
            return Err(GpuError::InvalidCommand(
                "draw outside of a render pass".to_owned(),
            ));
        }
        Command::Draw(draw) => {
            if let Some(hd) = &draw.hd {
                if !draw.program.is_textured() {
                    return Err(GpuError::InvalidCommand(format!(
                        "{:?} does not sample textures",
                        draw.program
                    )));
                }
                let desc = lookup.lookup_image(hd.image)?;
                if desc.format != ImageFormat::Rgba8 || desc.levels < hd.params.levels {
                    return Err(GpuError::InvalidCommand(format!(
                        "replacement image {:?} is {:?} with {} levels",
                        hd.image, desc.format, desc.levels
                    )));
                }
            }
        }
        Command::PixelBarrier => {}
        Command::EndRenderPass => {
            if !pass_open {
                return Err(GpuError::InvalidCommand(
                    "render pass ended without being begun".to_owned(),
                ));
            }
            return Ok(false);
        }
    }
    Ok(pass_open)
}
