// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

// STREAMS and interface ioctls for illumos/Solaris that have yet to be included in libc.

#![allow(non_camel_case_types)]
#![allow(unused)]

use std::mem;

pub const IOCPARM_MASK: u32 = 0xff; // parameter length, at most 8 bits
pub const IOCPARM_SHIFT: usize = 16;
pub const IOCGROUP_SHIFT: usize = 8;

pub const IOC_VOID: u32 = 0x20000000; // no parameters
pub const IOC_OUT: u32 = 0x40000000; // copy parameters out
pub const IOC_IN: u32 = 0x80000000; // copy parameters in
pub const IOC_INOUT: u32 = IOC_IN | IOC_OUT; // copy parameters in and out

// illumos declares ioctl requests as a signed `int`.
#[allow(non_snake_case)]
pub const fn _IOC(inout: u32, group: u8, num: u8, len: usize) -> libc::c_int {
    (inout
        | (((len as u32) & IOCPARM_MASK) << IOCPARM_SHIFT)
        | ((group as u32) << IOCGROUP_SHIFT)
        | num as u32) as libc::c_int
}

#[allow(non_snake_case)]
pub const fn _IOW<T: Sized>(g: u8, n: u8) -> libc::c_int {
    _IOC(IOC_IN, g, n, mem::size_of::<T>())
}

#[allow(non_snake_case)]
pub const fn _IOWR<T: Sized>(g: u8, n: u8) -> libc::c_int {
    _IOC(IOC_INOUT, g, n, mem::size_of::<T>())
}

// <sys/stropts.h>
pub const STR: libc::c_int = (b'S' as libc::c_int) << 8;
pub const I_PUSH: libc::c_int = STR | 0o02;
pub const I_STR: libc::c_int = STR | 0o10;
pub const I_PLINK: libc::c_int = STR | 0o26;
pub const I_PUNLINK: libc::c_int = STR | 0o27;
pub const MORECTL: libc::c_int = 1;
pub const MOREDATA: libc::c_int = 2;

// <sys/sockio.h>
pub const IF_UNITSEL: libc::c_int = _IOW::<libc::c_int>(b's', 54);
pub const SIOCGLIFMUXID: libc::c_int = _IOWR::<lifreq>(b'i', 131);
pub const SIOCSLIFMUXID: libc::c_int = _IOW::<lifreq>(b'i', 132);

// <net/if_tun.h>
pub const TUNNEWPPA: libc::c_int = ((b'T' as libc::c_int) << 16) | 0x0001;

pub const LIFNAMSIZ: usize = 32;

#[repr(C)]
pub struct strioctl {
    pub ic_cmd: libc::c_int,
    pub ic_timout: libc::c_int,
    pub ic_len: libc::c_int,
    pub ic_dp: *mut libc::c_char,
}

#[repr(C)]
pub struct strbuf {
    pub maxlen: libc::c_int,
    pub len: libc::c_int,
    pub buf: *mut libc::c_char,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union __c_anonymous_lifr_lifru1 {
    pub lifru_addrlen: libc::c_int,
    pub lifru_ppa: libc::c_uint,
}

// Only the mux ids are accessed; the remaining members are covered by padding sized to the
// largest one (`struct lif_nd_req`).
#[repr(C)]
#[derive(Clone, Copy)]
pub union __c_anonymous_lifr_lifru {
    pub lifru_muxid: [libc::c_int; 2],
    pub lifru_pad: [u64; 42],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct lifreq {
    pub lifr_name: [libc::c_char; LIFNAMSIZ],
    pub lifr_lifru1: __c_anonymous_lifr_lifru1,
    pub lifr_type: libc::c_uint,
    pub lifr_lifru: __c_anonymous_lifr_lifru,
}

impl lifreq {
    #[inline]
    pub fn empty() -> Self {
        lifreq {
            lifr_name: [0; LIFNAMSIZ],
            lifr_lifru1: __c_anonymous_lifr_lifru1 { lifru_ppa: 0 },
            lifr_type: 0,
            lifr_lifru: __c_anonymous_lifr_lifru { lifru_pad: [0; 42] },
        }
    }
}

#[cfg(any(target_os = "illumos", target_os = "solaris"))]
extern "C" {
    pub fn getmsg(
        fildes: libc::c_int,
        ctlptr: *mut strbuf,
        dataptr: *mut strbuf,
        flagsp: *mut libc::c_int,
    ) -> libc::c_int;

    pub fn putmsg(
        fildes: libc::c_int,
        ctlptr: *const strbuf,
        dataptr: *const strbuf,
        flags: libc::c_int,
    ) -> libc::c_int;
}
