pub mod errorfmt;
pub mod mmap;
pub mod numcell;
pub mod oserror;
pub mod timeout;
