pub(crate) mod meta;
pub(crate) mod poll;
pub(crate) mod ws;
