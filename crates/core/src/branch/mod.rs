//! Branch model operations and the resolver that linearizes a chat along its active path.

mod ops;
mod resolver;

pub use ops::{build_branch_path, create_branch_from_message, delete_branch, switch_to_branch};
pub use resolver::{
    BranchOption, BreadcrumbSegment, ResolverCache, branching_points, breadcrumb,
    resolve_branch_options, resolve_visible_messages,
};
