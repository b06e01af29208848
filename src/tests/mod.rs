mod semantic;
mod support;
