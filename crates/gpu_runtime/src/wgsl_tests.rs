#[test]
fn compute_wgsl_sources_parse_successfully() {
    parse_wgsl("resolve.wgsl", include_str!("wgpu_backend/resolve.wgsl"));
    parse_wgsl("blit.wgsl", include_str!("wgpu_backend/blit.wgsl"));
    parse_wgsl(
        "blit_cached.wgsl",
        include_str!("wgpu_backend/blit_cached.wgsl"),
    );
    parse_wgsl("copy.wgsl", include_str!("wgpu_backend/copy.wgsl"));
    parse_wgsl("mipmap.wgsl", include_str!("wgpu_backend/mipmap.wgsl"));
    parse_wgsl("scanout.wgsl", include_str!("wgpu_backend/scanout.wgsl"));
}

#[test]
fn primitive_wgsl_declares_every_fragment_entry() {
    let source = include_str!("wgpu_backend/primitive.wgsl");
    let module = parse_wgsl("primitive.wgsl", source);
    let entries: Vec<&str> = module
        .entry_points
        .iter()
        .map(|entry| entry.name.as_str())
        .collect();
    for expected in [
        "vs_main",
        "fs_flat",
        "fs_textured",
        "fs_textured_opaque",
        "fs_semi_textured",
        "fs_feedback_flat_none",
        "fs_feedback_flat_average",
        "fs_feedback_flat_add",
        "fs_feedback_flat_sub",
        "fs_feedback_flat_add_quarter",
        "fs_feedback_textured_none",
        "fs_feedback_textured_average",
        "fs_feedback_textured_add",
        "fs_feedback_textured_sub",
        "fs_feedback_textured_add_quarter",
    ] {
        assert!(entries.contains(&expected), "missing entry point {expected}");
    }
}

#[test]
fn primitive_wgsl_binds_replacement_texels() {
    let module = parse_wgsl("primitive.wgsl", include_str!("wgpu_backend/primitive.wgsl"));
    let bindings: Vec<(Option<&str>, u32)> = module
        .global_variables
        .iter()
        .filter_map(|(_, global)| {
            let binding = global.binding.as_ref()?;
            Some((global.name.as_deref(), binding.binding))
        })
        .collect();
    for expected in [
        (Some("vram"), 0),
        (Some("feedback_texture"), 1),
        (Some("hd_texels"), 2),
        (Some("hd"), 3),
    ] {
        assert!(bindings.contains(&expected), "missing binding {expected:?}");
    }
}

fn parse_wgsl(label: &str, source: &str) -> naga::Module {
    naga::front::wgsl::parse_str(source).unwrap_or_else(|error| {
        panic!(
            "WGSL parse failed for {label}: {}",
            error.emit_to_string(source)
        )
    })
}
