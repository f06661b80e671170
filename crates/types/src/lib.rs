mod entity;
mod page;

pub use entity::{
  OperationLog, Principal, Product, ProductDraft, RememberMeToken, User, UserDraft, STATUS_ACTIVE,
  STATUS_DISABLED,
};
pub use page::{
  FilterValue, PageRequest, PageRequestError, PageResult, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
};
