//! Cross-component tests driven through [`ResourceContext`](crate::context::ResourceContext)

mod frame_lifecycle;
