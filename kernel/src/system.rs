use crate::vm::Vm;
use alloc::boxed::Box;
use alloc::sync::Arc;
use once_cell::race::OnceBox;

static VM: OnceBox<Arc<Vm>> = OnceBox::new();

/// Install the kernel's VM subsystem. Called once at boot.
pub fn vm_init(vm: Vm) -> Arc<Vm> {
    let vm = Arc::new(vm);
    if VM.set(Box::new(Arc::clone(&vm))).is_err() {
        panic!("VM subsystem initialized twice");
    }
    vm
}

pub fn vm_system() -> Arc<Vm> {
    Arc::clone(VM.get().expect("VM subsystem not initialized."))
}

pub fn try_vm_system() -> Option<Arc<Vm>> {
    VM.get().cloned()
}
