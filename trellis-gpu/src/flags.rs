use bitflags::bitflags;

bitflags! {
    /// Usage of an allocated device buffer.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BufferUsages: u32 {
        /// Vertex or index data read by bottom-structure builds.
        const GEOMETRY_INPUT = 1 << 0;

        /// Instance-descriptor array read by top-structure builds.
        const INSTANCE_INPUT = 1 << 1;

        /// Holds a built structure.
        const STRUCTURE = 1 << 2;

        /// Scratch memory for builds.
        const SCRATCH = 1 << 3;

        /// Written from the host through the staging path.
        const UPLOAD = 1 << 4;
    }
}

bitflags! {
    /// Build hints, fixed at declare time.
    ///
    /// Changing them for an existing structure requires a full rebuild.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BuildFlags: u32 {
        /// Optimize for trace performance at the cost of build time.
        const PREFER_FAST_TRACE = 1 << 0;

        /// Optimize for build time at the cost of trace performance.
        const PREFER_FAST_BUILD = 1 << 1;

        /// The structure may be compacted after building.
        const ALLOW_COMPACTION = 1 << 2;

        /// The structure may be refit in place after building.
        const ALLOW_UPDATE = 1 << 3;
    }
}

bitflags! {
    /// Per-instance flags packed into the high byte of a [`TlasInstance`]'s
    /// second word; the values match the hardware instance record.
    ///
    /// [`TlasInstance`]: crate::TlasInstance
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct InstanceFlags: u8 {
        /// Disable triangle facing cull; set for double-sided geometry.
        const CULL_DISABLE = 1 << 0;

        /// Treat every triangle as opaque regardless of material.
        const FORCE_OPAQUE = 1 << 2;
    }
}
